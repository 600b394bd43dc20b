use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::*;
use russh::*;
use tracing::{debug, info, warn};

use super::common::{default_ssh_config, SshChannel};
use super::policy::{HostKey, HostKeyPolicy};
use super::scp::ScpClient;
use super::sftp::SftpClient;
use super::ssh_session::{
    AcceleratedCopy, AttributeTransfer, CommandExec, CommandOutput, Connection, Connector, Endpoint,
};
use crate::config::credentials::CredentialBundle;
use crate::error::{Error, Result};
use crate::progress::SharedProgress;

/// russh event handler. Only the host key check is of interest here.
pub struct ClientHandler {
    endpoint: Endpoint,
    policy: Box<dyn HostKeyPolicy>,
}

impl ClientHandler {
    pub fn new(endpoint: Endpoint, policy: Box<dyn HostKeyPolicy>) -> Self {
        Self { endpoint, policy }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let host_key = HostKey {
            algorithm: server_public_key.name().to_string(),
            fingerprint: server_public_key.fingerprint(),
        };

        let accepted = match check_known_hosts(
            self.endpoint.host(),
            self.endpoint.port(),
            server_public_key,
        ) {
            Ok(true) => {
                debug!(host = %self.endpoint, "host key matches known_hosts");
                true
            }
            Ok(false) => self.policy.accept_unknown(&self.endpoint, &host_key),
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(host = %self.endpoint, line, key = %host_key, "host key changed");
                false
            }
            Err(e) => {
                debug!(host = %self.endpoint, "unable to read known_hosts: {e}");
                self.policy.accept_unknown(&self.endpoint, &host_key)
            }
        };
        Ok(accepted)
    }
}

/// Opens connections with russh.
#[derive(Default)]
pub struct RusshConnector;

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &CredentialBundle,
        policy: Box<dyn HostKeyPolicy>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let config = Arc::new(default_ssh_config());
        let sh = ClientHandler::new(endpoint.clone(), policy);

        let connect = client::connect(config, (endpoint.host(), endpoint.port()), sh);
        let mut session = match tokio::time::timeout(timeout, connect).await {
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    host: endpoint.to_string(),
                    timeout,
                })
            }
            Ok(Err(russh::Error::UnknownKey)) => {
                return Err(Error::HostKeyRejected {
                    host: endpoint.to_string(),
                })
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(session)) => session,
        };

        let user = credentials.username();
        let auth_res = match credentials {
            CredentialBundle::Key { key, .. } => {
                session.authenticate_publickey(user, key.clone()).await?
            }
            CredentialBundle::Password { password, .. } => {
                session.authenticate_password(user, password.as_str()).await?
            }
        };

        if !auth_res {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .ok();
            return Err(Error::AuthenticationFailed {
                user: user.to_string(),
            });
        }

        info!(host = %endpoint, user, method = credentials.method(), "authenticated");
        Ok(Box::new(RusshConnection {
            session: Arc::new(session),
            endpoint: endpoint.clone(),
        }))
    }
}

pub struct RusshConnection {
    session: Arc<client::Handle<ClientHandler>>,
    endpoint: Endpoint,
}

#[async_trait]
impl Connection for RusshConnection {
    fn command_handle(&self) -> Box<dyn CommandExec> {
        Box::new(SshCommand {
            session: self.session.clone(),
        })
    }

    fn copy_handle(&self, progress: SharedProgress) -> Option<Box<dyn AcceleratedCopy>> {
        if self.session.is_closed() {
            return None;
        }
        Some(Box::new(ScpClient::new(
            self.session.clone(),
            self.endpoint.clone(),
            progress,
        )))
    }

    async fn open_transfer_handle(&self) -> Result<Box<dyn AttributeTransfer>> {
        let sftp = SftpClient::open(&self.session).await?;
        Ok(Box::new(sftp))
    }
}

/// Command execution over the shared connection. Closing it ends the
/// connection for every handle.
pub struct SshCommand {
    session: Arc<client::Handle<ClientHandler>>,
}

#[async_trait]
impl CommandExec for SshCommand {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let channel = self.session.channel_open_session().await?;
        SshChannel::new(channel).call(command).await
    }

    async fn close(&self) -> Result<()> {
        self.session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}
