use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use crate::collaborator::{CollaboratorError, DomainCollaborator, ExecutionReport};
use crate::jobs::JobRecord;

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

/// Poll `cond` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Replays a fixed list of responses, repeating the last one.
pub(crate) struct ScriptedCollaborator {
    responses: Mutex<Vec<Result<ExecutionReport, CollaboratorError>>>,
    pub(crate) seen: Mutex<Vec<JobRecord>>,
}

impl ScriptedCollaborator {
    pub(crate) fn new(responses: Vec<Result<ExecutionReport, CollaboratorError>>) -> Self {
        assert!(!responses.is_empty());
        Self {
            responses: Mutex::new(responses),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always(response: Result<ExecutionReport, CollaboratorError>) -> Self {
        Self::new(vec![response])
    }

    pub(crate) fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl DomainCollaborator for ScriptedCollaborator {
    fn execute(&self, job: &JobRecord) -> Result<ExecutionReport, CollaboratorError> {
        self.seen.lock().unwrap().push(job.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses[0].clone()
        }
    }
}
