//! Time-bounded subprocess execution (spec §4.A).
//!
//! Grounded on `nextest-runner/src/test_command/*.rs` and the
//! `tokio::select!` state machine in `nextest-runner/src/runner/executor.rs`
//! (`child_acc.fill_buf()` / `child.wait()` / interval-sleep / request
//! channel), generalized from "run one test binary" to "run an arbitrary
//! declarative `Command`" since this component is a utility used by every
//! other subsystem in this workspace, not just the test runner.

mod builder;
mod exec;

pub use builder::{Command, LineAction, SuccessStartPredicate, Timeout};
pub use exec::{CommandExecutor, CommandHandle, CommandResult, KillSwitch};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh", ["-c", script])
    }

    #[tokio::test]
    async fn successful_exit_is_ok() {
        let executor = CommandExecutor::new();
        let handle = executor.spawn(sh("exit 0")).unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure() {
        let executor = CommandExecutor::new();
        let handle = executor.spawn(sh("exit 7")).unwrap();
        let err = handle.wait().await.unwrap_err();
        match err {
            crate::errors::CommandError::NonZeroExit { code, .. } => assert_eq!(code, Some(7)),
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_success_exit_codes() {
        let executor = CommandExecutor::new();
        let mut command = sh("exit 42");
        command.success_exit_codes = [42].into_iter().collect();
        let handle = executor.spawn(command).unwrap();
        let result = handle.wait().await.unwrap();
        assert_eq!(result.exit_code, Some(42));
    }

    #[tokio::test]
    async fn deadline_expiry_is_final_even_if_process_later_exits_zero() {
        let executor = CommandExecutor::new();
        let mut command = sh("sleep 2 && exit 0");
        command.timeout = Some(Timeout::Fixed(Duration::from_millis(50)));
        let handle = executor.spawn(command).unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, crate::errors::CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn stdout_lines_reach_callback() {
        use std::sync::{Arc, Mutex};

        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_clone = lines.clone();

        let executor = CommandExecutor::new();
        let mut command = sh("printf 'a\\nb\\n'");
        command.on_stdout_line = Some(Arc::new(move |line: &str| {
            lines_clone.lock().unwrap().push(line.to_string());
            LineAction::Continue
        }));
        let handle = executor.spawn(command).unwrap();
        handle.wait().await.unwrap();

        assert_eq!(*lines.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn kill_terminates_long_running_command() {
        let executor = CommandExecutor::new();
        let handle = executor.spawn(sh("sleep 30")).unwrap();
        handle.kill();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err,
            crate::errors::CommandError::NonZeroExit { .. } | crate::errors::CommandError::Interrupted
        ));
    }

    #[tokio::test]
    async fn extra_env_layers_over_base_env() {
        let executor = CommandExecutor::new();
        executor.set_base_env("FROM_BASE", "base-value");
        executor.set_base_env("OVERRIDE_ME", "base-wins-if-not-overridden");

        let mut command = sh("printf \"$FROM_BASE,$OVERRIDE_ME\"");
        command
            .extra_env
            .insert("OVERRIDE_ME".to_string(), "extra-wins".to_string());

        let handle = executor.spawn(command).unwrap();
        let result = handle.wait().await.unwrap();
        let stdout = String::from_utf8_lossy(&result.stdout);
        assert_eq!(stdout, "base-value,extra-wins");
    }
}
