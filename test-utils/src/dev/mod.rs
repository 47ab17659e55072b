// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging setup shared by unit tests.

use slog::{debug, o, Drain, Logger};

/// A logger scoped to one test.
///
/// Output goes through the test harness's captured stdout, so it is only
/// shown for failing tests.
pub struct LogContext {
    pub log: Logger,
    test_name: String,
}

impl LogContext {
    pub fn new(test_name: &str) -> LogContext {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let log = Logger::root(drain, o!("test_name" => test_name.to_string()));
        LogContext { log, test_name: test_name.to_string() }
    }

    /// Marks the test as having passed.
    pub fn cleanup_successful(self) {
        debug!(self.log, "test complete"; "test" => &self.test_name);
    }
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`.
pub fn test_setup_log(test_name: &str) -> LogContext {
    LogContext::new(test_name)
}
