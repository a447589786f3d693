//! Recording test double for [`CommandRunner`].
//!
//! Commands are matched by prefix against their command line; the most
//! recently registered matching rule wins. Unmatched commands succeed with
//! empty output. Pauses are recorded instead of slept.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::time::Duration;

use super::{CommandOutput, CommandRunner, CommandSpec};

type Handler = Box<dyn Fn(&CommandSpec) -> CommandOutput>;

pub struct MockRunner {
    rules: RefCell<Vec<(String, Handler)>>,
    calls: RefCell<Vec<CommandSpec>>,
    pauses: RefCell<Vec<Duration>>,
    missing_tools: RefCell<BTreeSet<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            rules: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
            pauses: RefCell::new(Vec::new()),
            missing_tools: RefCell::new(BTreeSet::new()),
        }
    }

    /// Answer commands starting with `prefix` through `handler`.
    pub fn on(
        &self,
        prefix: &str,
        handler: impl Fn(&CommandSpec) -> CommandOutput + 'static,
    ) -> &Self {
        self.rules
            .borrow_mut()
            .push((prefix.to_string(), Box::new(handler)));
        self
    }

    /// Commands starting with `prefix` succeed and print `stdout`.
    pub fn reply(&self, prefix: &str, stdout: &str) -> &Self {
        let stdout = stdout.to_string();
        self.on(prefix, move |_| CommandOutput::success(stdout.clone()))
    }

    /// Commands starting with `prefix` exit with status 1.
    pub fn fail(&self, prefix: &str) -> &Self {
        let message = format!("mock: {} failed", prefix);
        self.on(prefix, move |_| CommandOutput::exit(1, message.clone()))
    }

    pub fn missing_tool(&self, tool: &str) -> &Self {
        self.missing_tools.borrow_mut().insert(tool.to_string());
        self
    }

    /// Command lines executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.command_line()).collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.borrow().clone()
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.borrow().clone()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn execute(&self, spec: &CommandSpec) -> CommandOutput {
        self.calls.borrow_mut().push(spec.clone());
        let line = spec.command_line();
        let rules = self.rules.borrow();
        match rules.iter().rev().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, handler)) => handler(spec),
            None => CommandOutput::success(""),
        }
    }

    fn tool_exists(&self, tool: &str) -> bool {
        !self.missing_tools.borrow().contains(tool)
    }

    fn pause(&self, duration: Duration) {
        self.pauses.borrow_mut().push(duration);
    }
}
