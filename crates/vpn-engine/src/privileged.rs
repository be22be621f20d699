//! Privileged OS operations used on teardown paths.
//!
//! Outcomes are reported back to the orchestrator, which logs them; a
//! failing helper never changes the connection state.

use crate::config::PrivilegedConfig;
use std::net::IpAddr;
use std::process::Command;
use tracing::debug;

/// What the last attempt left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownContext {
    pub adapter: Option<String>,
    pub server_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrivilegedError {
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with status {code:?}")]
    Failed { program: String, code: Option<i32> },

    #[error("Empty command template")]
    EmptyCommand,
}

pub trait PrivilegedOps: Send {
    fn reset_adapter(&mut self, adapter: &str) -> Result<(), PrivilegedError>;

    /// Undo route/DNS changes of the attempt that just went down.
    fn restore_after_teardown(&mut self, ctx: &TeardownContext) -> Result<(), PrivilegedError>;
}

/// Runs operator-supplied command templates.
///
/// Unset templates make the corresponding operation a no-op.
#[derive(Debug, Clone, Default)]
pub struct CommandPrivilegedOps {
    config: PrivilegedConfig,
}

impl CommandPrivilegedOps {
    pub fn new(config: PrivilegedConfig) -> Self {
        Self { config }
    }
}

impl PrivilegedOps for CommandPrivilegedOps {
    fn reset_adapter(&mut self, adapter: &str) -> Result<(), PrivilegedError> {
        match &self.config.reset_adapter {
            Some(template) => run(&render(template, Some(adapter), None)),
            None => Ok(()),
        }
    }

    fn restore_after_teardown(&mut self, ctx: &TeardownContext) -> Result<(), PrivilegedError> {
        match &self.config.restore_routes {
            Some(template) => run(&render(template, ctx.adapter.as_deref(), ctx.server_ip)),
            None => Ok(()),
        }
    }
}

fn render(template: &[String], adapter: Option<&str>, ip: Option<IpAddr>) -> Vec<String> {
    let ip = ip.map(|ip| ip.to_string()).unwrap_or_default();
    template
        .iter()
        .map(|arg| {
            arg.replace("{adapter}", adapter.unwrap_or_default())
                .replace("{ip}", &ip)
        })
        .collect()
}

fn run(argv: &[String]) -> Result<(), PrivilegedError> {
    let (program, args) = argv.split_first().ok_or(PrivilegedError::EmptyCommand)?;
    debug!("Running privileged helper: {}", argv.join(" "));

    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| PrivilegedError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(PrivilegedError::Failed {
            program: program.clone(),
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let argv = render(
            &strings(&["ip", "route", "del", "{ip}", "dev", "{adapter}"]),
            Some("tun0"),
            Some("10.0.0.1".parse().unwrap()),
        );
        assert_eq!(argv, strings(&["ip", "route", "del", "10.0.0.1", "dev", "tun0"]));
    }

    #[test]
    fn test_unset_templates_are_noops() {
        let mut ops = CommandPrivilegedOps::default();
        assert!(ops.reset_adapter("tun0").is_ok());
        assert!(
            ops.restore_after_teardown(&TeardownContext { adapter: None, server_ip: None })
                .is_ok()
        );
    }

    #[test]
    fn test_failures_are_reported() {
        assert_eq!(run(&[]), Err(PrivilegedError::EmptyCommand));

        let mut ops = CommandPrivilegedOps::new(PrivilegedConfig {
            reset_adapter: Some(strings(&["/nonexistent/reset-helper", "{adapter}"])),
            restore_routes: None,
        });
        assert!(matches!(
            ops.reset_adapter("tun0"),
            Err(PrivilegedError::Spawn { .. })
        ));
    }
}
