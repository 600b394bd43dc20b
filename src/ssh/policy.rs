use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{info, warn};

use super::ssh_session::Endpoint;

/// What the remote presented during key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub algorithm: String,
    pub fingerprint: String,
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} SHA256:{}", self.algorithm, self.fingerprint)
    }
}

/// Decides whether a host missing from `known_hosts` may be trusted.
/// Hosts whose key changed never reach the policy.
pub trait HostKeyPolicy: Send + Sync {
    fn accept_unknown(&self, endpoint: &Endpoint, key: &HostKey) -> bool;
}

pub struct AutoAcceptPolicy;

impl HostKeyPolicy for AutoAcceptPolicy {
    fn accept_unknown(&self, endpoint: &Endpoint, key: &HostKey) -> bool {
        info!(host = %endpoint, key = %key, "accepting unknown host key");
        true
    }
}

pub struct RejectPolicy;

impl HostKeyPolicy for RejectPolicy {
    fn accept_unknown(&self, endpoint: &Endpoint, key: &HostKey) -> bool {
        warn!(host = %endpoint, key = %key, "rejecting unknown host key");
        false
    }
}

/// Asks on the terminal. Anything other than `y`/`yes` is a refusal.
pub struct PromptPolicy {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl PromptPolicy {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(io::stdin()), io::stderr())
    }

    pub fn with_io(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    fn ask(&self, endpoint: &Endpoint, key: &HostKey) -> io::Result<bool> {
        {
            let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
            write!(
                output,
                "The authenticity of host '{}' can't be established.\n{} key fingerprint is SHA256:{}.\nContinue connecting (yes/no)? ",
                endpoint, key.algorithm, key.fingerprint
            )?;
            output.flush()?;
        }
        let mut answer = String::new();
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

impl Default for PromptPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKeyPolicy for PromptPolicy {
    fn accept_unknown(&self, endpoint: &Endpoint, key: &HostKey) -> bool {
        match self.ask(endpoint, key) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(host = %endpoint, "unable to prompt for host key: {e}");
                false
            }
        }
    }
}

/// Selects a policy by name. Each call to `build` yields a fresh instance, so
/// no two sessions share policy state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TrustPolicy {
    #[default]
    #[serde(alias = "auto-accept")]
    Auto,
    Reject,
    Prompt,
}

impl TrustPolicy {
    pub fn build(self) -> Box<dyn HostKeyPolicy> {
        match self {
            TrustPolicy::Auto => Box::new(AutoAcceptPolicy),
            TrustPolicy::Reject => Box::new(RejectPolicy),
            TrustPolicy::Prompt => Box::new(PromptPolicy::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn key() -> HostKey {
        HostKey {
            algorithm: "ssh-ed25519".into(),
            fingerprint: "abc".into(),
        }
    }

    #[test]
    fn test_auto_and_reject() {
        let endpoint = Endpoint::new("10.0.0.5", 22);
        assert!(AutoAcceptPolicy.accept_unknown(&endpoint, &key()));
        assert!(!RejectPolicy.accept_unknown(&endpoint, &key()));
    }

    #[test]
    fn test_prompt_reads_answer() {
        let endpoint = Endpoint::new("10.0.0.5", 22);
        let yes = PromptPolicy::with_io(Cursor::new(b"YES\n".to_vec()), io::sink());
        assert!(yes.accept_unknown(&endpoint, &key()));

        let no = PromptPolicy::with_io(Cursor::new(b"n\n".to_vec()), io::sink());
        assert!(!no.accept_unknown(&endpoint, &key()));

        let closed = PromptPolicy::with_io(Cursor::new(Vec::new()), io::sink());
        assert!(!closed.accept_unknown(&endpoint, &key()));
    }

    #[test]
    fn test_trust_policy_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            policy: TrustPolicy,
        }
        let holder: Holder = toml::from_str("policy = \"prompt\"").unwrap();
        assert_eq!(holder.policy, TrustPolicy::Prompt);
        assert_eq!(TrustPolicy::default(), TrustPolicy::Auto);
    }
}
