/// Judging endpoint routes - defines only paths, not transport
/// Keeps the request client and the downloader from drifting apart
/// on URL shapes, and keeps them deterministic for tests.

/// Header carrying the judgehost name on every request.
pub const HOSTNAME_HEADER: &str = "X-Djudge-Hostname";

pub const JUDGEHOSTS: &str = "/judgehosts";
pub const JUDGING_RUNS: &str = "/judging_runs";

/// Ask for new work with `?judgehost=<host>`; the client encodes the query.
pub const JUDGINGS: &str = "/judgings";
pub const JUDGEHOST_PARAM: &str = "judgehost";

/// Which half of a testcase to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestcasePart {
    Input,
    Output,
}

impl TestcasePart {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestcasePart::Input => "input",
            TestcasePart::Output => "output",
        }
    }

    /// File extension used for the local copy.
    pub fn extension(&self) -> &'static str {
        match self {
            TestcasePart::Input => "in",
            TestcasePart::Output => "out",
        }
    }
}

/// Compile status / judge error updates for a judging
pub fn judging(judging_id: i64) -> String {
    format!("{}/{}", JUDGINGS, judging_id)
}

/// Next testcase still to be judged for a judging
pub fn next_testcase(judging_id: i64) -> String {
    format!("/testcases?judgingid={}", judging_id)
}

pub fn submission_files(submit_id: i64) -> String {
    format!("/submission_files?id={}", submit_id)
}

pub fn executable(exec_id: &str) -> String {
    format!("/executable?execid={}", exec_id)
}

pub fn testcase_file(testcase_id: i64, part: TestcasePart) -> String {
    format!("/testcase_files?testcaseid={}&{}", testcase_id, part.as_str())
}
