use std::collections::HashSet;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rand::Rng;
use regex::Regex;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const SUFFIX_LEN: usize = 6;

/// Produces `<timestamp>-<6 hex>.<ext>` names.
///
/// Within one second only 2^24 suffixes exist, so names handed out during the
/// current second are remembered and a repeated suffix is redrawn.
#[derive(Debug)]
pub struct TraceNameGenerator {
    extension: String,
    current_stamp: String,
    issued: HashSet<String>,
}

impl TraceNameGenerator {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            current_stamp: String::new(),
            issued: HashSet::new(),
        }
    }

    pub fn next_name(&mut self) -> String {
        self.next_name_at(Local::now())
    }

    pub fn next_name_at<Tz: TimeZone>(&mut self, now: DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        if stamp != self.current_stamp {
            self.current_stamp = stamp;
            self.issued.clear();
        }
        let mut rng = rand::thread_rng();
        loop {
            let suffix = random_suffix(&mut rng);
            if self.issued.insert(suffix.clone()) {
                return format!("{}-{}.{}", self.current_stamp, suffix, self.extension);
            }
        }
    }

    /// Full device path for a fresh trace in `remote_dir`.
    pub fn next_remote_path(&mut self, remote_dir: &str) -> String {
        let name = self.next_name();
        format!("{}/{}", remote_dir.trim_end_matches('/'), name)
    }
}

fn random_suffix<R: Rng>(rng: &mut R) -> String {
    let bytes: [u8; SUFFIX_LEN / 2] = rng.gen();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFileName {
    pub captured_at: NaiveDateTime,
    pub suffix: String,
    pub extension: String,
}

/// Parses a basename produced by `TraceNameGenerator`.
pub fn parse_trace_file_name(name: &str, extension: &str) -> Option<TraceFileName> {
    let pattern = format!(
        r"^(\d{{4}}-\d{{2}}-\d{{2}}-\d{{2}}-\d{{2}}-\d{{2}})-([0-9a-f]{{{SUFFIX_LEN}}})\.{}$",
        regex::escape(extension)
    );
    let name_re = Regex::new(&pattern).ok()?;
    let caps = name_re.captures(name)?;
    let captured_at = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok()?;
    Some(TraceFileName {
        captured_at,
        suffix: caps[2].to_string(),
        extension: extension.to_string(),
    })
}
