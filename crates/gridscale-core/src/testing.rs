//! Test doubles for the time and command seams.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::clock::Clock;
use crate::error::{GridScaleError, Result};
use crate::exec::{command_line, CommandExecutor};

/// A clock that only moves when told to.
pub struct FakeClock {
    now: Mutex<NaiveDateTime>,
}

impl FakeClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// 2024-01-18 12:00:00, the default moment of most tests.
    pub fn noon() -> Self {
        Self::new(ts(2024, 1, 18, 12, 0, 0))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

/// Build a timestamp without going through fallible constructors in tests.
pub fn ts(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, min, sec))
        .unwrap()
}

/// Canned response for a command line.
#[derive(Debug, Clone)]
enum Response {
    Stdout(String),
    Exit(i32),
}

/// Answers commands from a script and remembers what was executed.
///
/// Responses registered for the same command are served in order; the last
/// one repeats. Unknown commands succeed with empty output.
#[derive(Default)]
pub struct FakeExecutor {
    responses: Mutex<HashMap<String, VecDeque<Response>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `stdout` as the next answer to `command`.
    pub fn on(&self, command: &str, stdout: &str) -> &Self {
        self.push(command, Response::Stdout(stdout.to_string()))
    }

    /// Queue a non-zero exit as the next answer to `command`.
    pub fn fail(&self, command: &str, code: i32) -> &Self {
        self.push(command, Response::Exit(code))
    }

    fn push(&self, command: &str, response: Response) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Every command executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether `command` has been executed.
    pub fn called(&self, command: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == command)
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String> {
        let command = command_line(program, args);
        self.calls.lock().unwrap().push(command.clone());
        let response = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&command) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match response {
            Some(Response::Stdout(out)) => Ok(out),
            Some(Response::Exit(code)) => Err(GridScaleError::Execution {
                command,
                code: Some(code),
                stderr: "scripted failure".to_string(),
            }),
            None => Ok(String::new()),
        }
    }
}
