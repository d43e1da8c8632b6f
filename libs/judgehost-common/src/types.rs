use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Accepts a value encoded either natively or as a JSON string.
///
/// The judging endpoint is inconsistent about quoting ids and limits
/// (`"submitid": "12"` next to `"cid": 3`), so every numeric field goes through here.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Plain(T),
        Text(String),
    }

    match Raw::<T>::deserialize(deserializer)? {
        Raw::Plain(value) => Ok(value),
        Raw::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Immutable description of one judging task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeInfo {
    #[serde(rename = "submitid", deserialize_with = "lenient")]
    pub submit_id: i64,
    #[serde(rename = "cid", deserialize_with = "lenient", default)]
    pub contest_id: i64,
    #[serde(rename = "teamid", deserialize_with = "lenient", default)]
    pub team_id: i64,
    #[serde(rename = "judgingid", deserialize_with = "lenient")]
    pub judging_id: i64,
    #[serde(rename = "probid", deserialize_with = "lenient", default)]
    pub problem_id: i64,
    #[serde(rename = "langid", default)]
    pub language: String,
    /// Seconds.
    #[serde(rename = "maxruntime", deserialize_with = "lenient")]
    pub time_limit: f64,
    /// Kilobytes; zero means "not declared".
    #[serde(rename = "memlimit", deserialize_with = "lenient", default)]
    pub memory_limit: i64,
    /// Bytes.
    #[serde(rename = "output_limit", deserialize_with = "lenient")]
    pub output_limit: u64,
    #[serde(rename = "compile_script")]
    pub build_zip: String,
    #[serde(rename = "compile_script_md5sum")]
    pub build_zip_md5: String,
    #[serde(rename = "run")]
    pub run_zip: String,
    #[serde(rename = "run_md5sum")]
    pub run_zip_md5: String,
    #[serde(rename = "compare")]
    pub compare_zip: String,
    #[serde(rename = "compare_md5sum")]
    pub compare_zip_md5: String,
    #[serde(default)]
    pub compare_args: String,
}

/// The three executable bundles every judging ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    Build,
    Run,
    Compare,
}

impl BundleKind {
    /// Unpack/compile order inside the sandbox.
    pub const ALL: [BundleKind; 3] = [BundleKind::Build, BundleKind::Run, BundleKind::Compare];

    /// Subdirectory of the working directory that holds the bundle.
    pub fn dir(self) -> &'static str {
        match self {
            BundleKind::Build => "build",
            BundleKind::Run => "run",
            BundleKind::Compare => "compare",
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bundle<'a> {
    pub kind: BundleKind,
    pub name: &'a str,
    pub md5: &'a str,
}

impl JudgeInfo {
    pub fn bundle(&self, kind: BundleKind) -> Bundle<'_> {
        let (name, md5) = match kind {
            BundleKind::Build => (&self.build_zip, &self.build_zip_md5),
            BundleKind::Run => (&self.run_zip, &self.run_zip_md5),
            BundleKind::Compare => (&self.compare_zip, &self.compare_zip_md5),
        };
        Bundle { kind, name, md5 }
    }

    /// Working directory name under the judge root: `c<cid>-s<submitid>-j<judgingid>`.
    pub fn workdir_name(&self) -> String {
        format!("c{}-s{}-j{}", self.contest_id, self.submit_id, self.judging_id)
    }
}

/// One testcase as handed out by the endpoint, fetched one at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseInfo {
    #[serde(rename = "testcaseid", deserialize_with = "lenient")]
    pub testcase_id: i64,
    #[serde(deserialize_with = "lenient")]
    pub rank: i64,
    #[serde(rename = "probid", deserialize_with = "lenient", default)]
    pub problem_id: i64,
    #[serde(rename = "md5sum_input")]
    pub md5_input: String,
    #[serde(rename = "md5sum_output")]
    pub md5_output: String,
}

/// A submitted source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionFile {
    pub filename: String,
    /// Base64 encoded.
    pub content: String,
}

/// Grading outcome of a testcase (or of the whole submission for compile errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "timelimit")]
    TimeLimit,
    #[serde(rename = "wrong-answer")]
    WrongAnswer,
    #[serde(rename = "correct")]
    Correct,
    #[serde(rename = "compiler-error")]
    CompileError,
    #[serde(rename = "run-error")]
    RunError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::TimeLimit => "timelimit",
            Verdict::WrongAnswer => "wrong-answer",
            Verdict::Correct => "correct",
            Verdict::CompileError => "compiler-error",
            Verdict::RunError => "run-error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timelimit" => Ok(Verdict::TimeLimit),
            "wrong-answer" => Ok(Verdict::WrongAnswer),
            "correct" => Ok(Verdict::Correct),
            "compiler-error" => Ok(Verdict::CompileError),
            "run-error" => Ok(Verdict::RunError),
            other => Err(WireError::UnknownVerdict(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("missing form field `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    Invalid { field: &'static str, value: String },
    #[error("unknown verdict `{0}`")]
    UnknownVerdict(String),
}

/// Outcome record for a single testcase.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub judging_id: i64,
    pub testcase_id: i64,
    pub verdict: Verdict,
    /// Wall seconds.
    pub run_time: f64,
    pub output_run: Vec<u8>,
    pub output_error: Vec<u8>,
    pub output_diff: Vec<u8>,
    /// Human readable system metadata (time, memory).
    pub output_system: String,
}

impl RunResult {
    pub fn new(judging_id: i64, testcase_id: i64, verdict: Verdict, run_time: f64) -> Self {
        Self {
            judging_id,
            testcase_id,
            verdict,
            run_time,
            output_run: Vec::new(),
            output_error: Vec::new(),
            output_diff: Vec::new(),
            output_system: String::new(),
        }
    }

    /// Form fields posted to `/judging_runs`. Output blobs are base64 encoded.
    pub fn to_form(&self, judgehost: &str) -> Vec<(&'static str, String)> {
        let encode = |data: &[u8]| general_purpose::STANDARD.encode(data);
        vec![
            ("judgingid", self.judging_id.to_string()),
            ("testcaseid", self.testcase_id.to_string()),
            ("runresult", self.verdict.to_string()),
            ("runtime", self.run_time.to_string()),
            ("judgehost", judgehost.to_string()),
            ("output_run", encode(&self.output_run)),
            ("output_error", encode(&self.output_error)),
            ("output_system", encode(self.output_system.as_bytes())),
            ("output_diff", encode(&self.output_diff)),
        ]
    }

    /// Parses the form produced by [`RunResult::to_form`], the way the endpoint reads it.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, WireError> {
        fn field<'a>(form: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, WireError> {
            form.get(name).map(String::as_str).ok_or(WireError::Missing(name))
        }
        fn number<T: FromStr>(form: &HashMap<String, String>, name: &'static str) -> Result<T, WireError> {
            let raw = field(form, name)?;
            raw.parse().map_err(|_| WireError::Invalid { field: name, value: raw.to_string() })
        }
        fn blob(form: &HashMap<String, String>, name: &'static str) -> Result<Vec<u8>, WireError> {
            let raw = field(form, name)?;
            general_purpose::STANDARD
                .decode(raw)
                .map_err(|_| WireError::Invalid { field: name, value: raw.to_string() })
        }

        Ok(Self {
            judging_id: number(form, "judgingid")?,
            testcase_id: number(form, "testcaseid")?,
            verdict: field(form, "runresult")?.parse()?,
            run_time: number(form, "runtime")?,
            output_run: blob(form, "output_run")?,
            output_error: blob(form, "output_error")?,
            output_diff: blob(form, "output_diff")?,
            output_system: String::from_utf8(blob(form, "output_system")?).map_err(|e| WireError::Invalid {
                field: "output_system",
                value: e.to_string(),
            })?,
        })
    }
}
