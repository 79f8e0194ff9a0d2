//! Session configuration.

use std::time::Duration;

/// Timing and launch parameters for one debug session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Debuggee executable name, resolved against the workspace root.
    pub executable_name: String,
    /// Flag that puts the debuggee into debug-server mode.
    pub debug_server_flag: String,
    /// Fallback wait before `initialize` when the debuggee sends nothing first.
    pub settle_delay: Duration,
    /// Fallback wait between `initialize` and `launch`.
    pub launch_delay: Duration,
    /// Deadline for a correlated `stackTrace` reply.
    pub stack_trace_timeout: Duration,
    /// Time between SIGTERM and a hard kill.
    pub terminate_grace: Duration,
    /// How long shutdown waits for the debuggee to exit.
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable_name: "etch".to_string(),
            debug_server_flag: "--debug-server".to_string(),
            settle_delay: Duration::from_millis(500),
            launch_delay: Duration::from_millis(100),
            stack_trace_timeout: Duration::from_millis(1000),
            terminate_grace: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executable_name(mut self, name: impl Into<String>) -> Self {
        self.executable_name = name.into();
        self
    }

    pub fn with_debug_server_flag(mut self, flag: impl Into<String>) -> Self {
        self.debug_server_flag = flag.into();
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_stack_trace_timeout(mut self, timeout: Duration) -> Self {
        self.stack_trace_timeout = timeout;
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
