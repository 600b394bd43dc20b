use russh::{client, client::Msg, Channel, ChannelMsg};

use super::ssh_session::CommandOutput;
use crate::error::Result;

pub fn default_ssh_config() -> client::Config {
    client::Config {
        //inactivity_timeout: Some(Duration::from_secs(5)),
        ..<_>::default()
    }
}

/// A session channel that runs one command and collects what it prints.
pub struct SshChannel {
    channel: Channel<Msg>,
}

impl SshChannel {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }

    pub async fn call(mut self, command: &str) -> Result<CommandOutput> {
        self.channel.exec(true, command).await?;

        let mut output = CommandOutput::default();
        // The server closes the channel after the exit status, so draining
        // until `None` leaves both the status and all output in hand.
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }
        Ok(output)
    }
}
