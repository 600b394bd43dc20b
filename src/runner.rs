use std::io::{self, Write};

use tracing::debug;

use crate::error::{Error, Result};
use crate::ssh::session::{Handle, Session, TransportTag};
use crate::ssh::ssh_session::CommandOutput;

impl Session {
    /// Runs `commands` one after another and echoes their stdout.
    pub async fn run<S: AsRef<str>>(&self, commands: &[S]) -> Result<Vec<CommandOutput>> {
        self.run_with(commands, &mut io::stdout()).await
    }

    /// Like [`Session::run`] but writes to `out`.
    ///
    /// A non-zero exit status does not stop the batch; a failure to run a
    /// command at all does, and it is returned as is.
    pub async fn run_with<S: AsRef<str>, W: Write>(
        &self,
        commands: &[S],
        out: &mut W,
    ) -> Result<Vec<CommandOutput>> {
        let tag = TransportTag::CommandExecution;
        self.ensure_open(tag)?;
        let Handle::Command(ssh) = self.select(tag) else {
            return Err(Error::TransportUnavailable(tag));
        };

        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            let command = command.as_ref();
            let output = ssh.exec(command).await?;
            debug!(command, exit_status = ?output.exit_status, "command finished");

            for line in output.stdout_lines() {
                writeln!(out, "Input: {command} \nResult: {line}")?;
            }
            outputs.push(output);
        }
        Ok(outputs)
    }
}
