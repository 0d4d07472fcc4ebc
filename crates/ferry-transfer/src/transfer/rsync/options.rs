//! rsync command-line options

use std::sync::OnceLock;

use ferry_common::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default `--bwlimit`, in KiB/s
pub const DEFAULT_BW_LIMIT: i64 = 1_048_576;

/// `--info` flags passed by default
pub const DEFAULT_INFO: &[&str] = &[
    "COPY2", "DEL2", "REMOVE2", "SKIP2", "FLIST2", "PROGRESS2", "STATS2",
];

fn info_re() -> &'static Regex {
    static INFO_RE: OnceLock<Regex> = OnceLock::new();
    INFO_RE.get_or_init(|| Regex::new(r"^[A-Z]+\d?$").expect("valid regex"))
}

fn extra_flag_re() -> &'static Regex {
    static EXTRA_FLAG_RE: OnceLock<Regex> = OnceLock::new();
    EXTRA_FLAG_RE.get_or_init(|| {
        Regex::new(r"^(-[A-Za-z0-9]|--[a-z0-9]+(-[a-z0-9]+)*(=\S+)?)$").expect("valid regex")
    })
}

/// Flags for the rsync client, one field per option.
///
/// `Default` is archive-like; [`RsyncOptions::bare`] sets nothing.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RsyncOptions {
    /// `--recursive`
    pub recursive: bool,
    /// `--links`
    pub links: bool,
    /// `--perms`
    pub perms: bool,
    /// `--devices`
    pub devices: bool,
    /// `--specials`
    pub specials: bool,
    /// `--owner`
    pub owner: bool,
    /// `--group`
    pub group: bool,
    /// `--hard-links`
    pub hard_links: bool,
    /// `--delete`
    pub delete: bool,
    /// `--partial`
    pub partial: bool,
    /// `--human-readable`
    pub human_readable: bool,
    /// `--bwlimit=<KiB/s>`; required, and must be positive
    pub bw_limit: Option<i64>,
    /// `--log-file=<path>`
    pub log_file: Option<String>,
    /// `--info=<A,B,...>`
    pub info: Vec<String>,
    /// Any other flag, passed through verbatim
    pub extras: Vec<String>,
}

impl Default for RsyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            links: true,
            perms: true,
            devices: true,
            specials: true,
            owner: true,
            group: true,
            hard_links: true,
            delete: true,
            partial: true,
            human_readable: true,
            bw_limit: Some(DEFAULT_BW_LIMIT),
            log_file: None,
            info: DEFAULT_INFO.iter().map(|s| s.to_string()).collect(),
            extras: Vec::new(),
        }
    }
}

impl RsyncOptions {
    /// Options with every flag off and no bandwidth limit, which does not
    /// validate until one is set
    pub fn bare() -> Self {
        Self {
            recursive: false,
            links: false,
            perms: false,
            devices: false,
            specials: false,
            owner: false,
            group: false,
            hard_links: false,
            delete: false,
            partial: false,
            human_readable: false,
            bw_limit: None,
            log_file: None,
            info: Vec::new(),
            extras: Vec::new(),
        }
    }

    fn switches(&self) -> [(bool, &'static str); 11] {
        [
            (self.recursive, "--recursive"),
            (self.links, "--links"),
            (self.perms, "--perms"),
            (self.devices, "--devices"),
            (self.specials, "--specials"),
            (self.owner, "--owner"),
            (self.group, "--group"),
            (self.hard_links, "--hard-links"),
            (self.delete, "--delete"),
            (self.partial, "--partial"),
            (self.human_readable, "--human-readable"),
        ]
    }

    fn switch_mut(&mut self, flag: &str) -> Option<&mut bool> {
        Some(match flag {
            "--recursive" => &mut self.recursive,
            "--links" => &mut self.links,
            "--perms" => &mut self.perms,
            "--devices" => &mut self.devices,
            "--specials" => &mut self.specials,
            "--owner" => &mut self.owner,
            "--group" => &mut self.group,
            "--hard-links" => &mut self.hard_links,
            "--delete" => &mut self.delete,
            "--partial" => &mut self.partial,
            "--human-readable" => &mut self.human_readable,
            _ => return None,
        })
    }

    /// Check every option, reporting all problems at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.bw_limit.is_none() {
            errors.push("rsync bandwidth limit is required".to_string());
        }
        self.check_values(&mut errors);
        Error::check_validation(errors)
    }

    /// Problems with the values that are set
    fn check_values(&self, errors: &mut Vec<String>) {
        if let Some(limit) = self.bw_limit {
            if limit <= 0 {
                errors.push(format!("rsync bandwidth limit must be positive, got {}", limit));
            }
        }
        if self.log_file.as_deref().is_some_and(str::is_empty) {
            errors.push("rsync log file must not be empty".to_string());
        }
        for flag in &self.info {
            if !info_re().is_match(flag) {
                errors.push(format!("rsync info flag '{}' must match [A-Z]+\\d?", flag));
            }
        }
        for flag in &self.extras {
            if !extra_flag_re().is_match(flag) {
                errors.push(format!(
                    "rsync extra flag '{}' must look like -x or --long-flag[=value]",
                    flag
                ));
            }
        }
    }

    /// Command-line flags, in a stable order
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags: Vec<String> = self
            .switches()
            .into_iter()
            .filter(|(on, _)| *on)
            .map(|(_, flag)| flag.to_string())
            .collect();
        if let Some(limit) = self.bw_limit {
            flags.push(format!("--bwlimit={}", limit));
        }
        if let Some(path) = &self.log_file {
            flags.push(format!("--log-file={}", path));
        }
        if !self.info.is_empty() {
            flags.push(format!("--info={}", self.info.join(",")));
        }
        flags.extend(self.extras.iter().cloned());
        flags
    }

    /// Parse a flag list back into options. Flags that are not one of the
    /// named options land in `extras`. Every value given is checked; a
    /// missing `--bwlimit` is left for [`RsyncOptions::validate`].
    pub fn from_flags<I, T>(flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut options = Self::bare();
        let mut errors = Vec::new();
        for flag in flags {
            let flag = flag.as_ref().trim();
            if let Some(switch) = options.switch_mut(flag) {
                *switch = true;
            } else if let Some(value) = flag.strip_prefix("--bwlimit=") {
                match value.parse::<i64>() {
                    Ok(limit) => options.bw_limit = Some(limit),
                    Err(_) => errors.push(format!(
                        "rsync bandwidth limit '{}' is not an integer",
                        value
                    )),
                }
            } else if let Some(value) = flag.strip_prefix("--log-file=") {
                options.log_file = Some(value.to_string());
            } else if let Some(value) = flag.strip_prefix("--info=") {
                options
                    .info
                    .extend(value.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            } else {
                options.extras.push(flag.to_string());
            }
        }
        options.check_values(&mut errors);
        Error::check_validation(errors)?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_of(result: Result<impl std::fmt::Debug>) -> Vec<String> {
        match result.unwrap_err() {
            Error::Validation { errors } => errors,
            other => panic!("expected Validation, got {other}"),
        }
    }

    /// Story: flags re-parse to the options they came from
    #[test]
    fn story_flags_reparse_to_same_values() {
        let options = RsyncOptions {
            recursive: true,
            delete: true,
            bw_limit: Some(100),
            ..RsyncOptions::bare()
        };
        let flags = options.to_flags();
        assert_eq!(flags, vec!["--recursive", "--delete", "--bwlimit=100"]);

        let mut reparsed = RsyncOptions::bare();
        for flag in &flags {
            let single = RsyncOptions::from_flags([flag]).unwrap();
            reparsed.recursive |= single.recursive;
            reparsed.delete |= single.delete;
            reparsed.bw_limit = single.bw_limit.or(reparsed.bw_limit);
        }
        assert_eq!(reparsed, options);
        assert_eq!(RsyncOptions::from_flags(&flags).unwrap(), options);
    }

    #[test]
    fn default_is_archive_like() {
        let flags = RsyncOptions::default().to_flags();
        let archive = [
            "--recursive",
            "--links",
            "--perms",
            "--owner",
            "--group",
            "--hard-links",
        ];
        for flag in archive {
            assert!(flags.contains(&flag.to_string()), "missing {flag}");
        }
        let info = "--info=COPY2,DEL2,REMOVE2,SKIP2,FLIST2,PROGRESS2,STATS2";
        assert!(flags.contains(&info.to_string()));
        assert!(flags.contains(&format!("--bwlimit={}", DEFAULT_BW_LIMIT)));
        assert!(RsyncOptions::default().validate().is_ok());
        assert_eq!(
            RsyncOptions::from_flags(RsyncOptions::default().to_flags()).unwrap(),
            RsyncOptions::default()
        );
    }

    #[test]
    fn missing_bandwidth_limit_is_rejected() {
        let unlimited = RsyncOptions {
            bw_limit: None,
            ..RsyncOptions::default()
        };
        let errors = errors_of(unlimited.validate());
        assert_eq!(errors, vec!["rsync bandwidth limit is required"]);

        let parsed = RsyncOptions::from_flags(["--recursive", "--delete"]).unwrap();
        assert!(parsed.bw_limit.is_none());
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn bandwidth_limit_must_be_positive() {
        let zero = RsyncOptions {
            bw_limit: Some(0),
            ..RsyncOptions::default()
        };
        assert_eq!(errors_of(zero.validate()).len(), 1);

        let errors = errors_of(RsyncOptions::from_flags(["--bwlimit="]));
        assert!(errors[0].contains("not an integer"));

        let errors = errors_of(RsyncOptions::from_flags(["--bwlimit=-5"]));
        assert!(errors[0].contains("must be positive"));
    }

    #[test]
    fn info_and_extra_flags_are_checked_together() {
        let options = RsyncOptions {
            info: vec!["COPY2".to_string(), "copy".to_string(), "STATS22".to_string()],
            extras: vec![
                "-z".to_string(),
                "--compress-level=9".to_string(),
                "--checksum".to_string(),
                "rm -rf".to_string(),
                "---x".to_string(),
            ],
            ..RsyncOptions::default()
        };
        let errors = errors_of(options.validate());
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("'copy'")));
        assert!(errors.iter().any(|e| e.contains("'rm -rf'")));
    }

    #[test]
    fn unknown_flags_become_extras() {
        let options =
            RsyncOptions::from_flags(["--checksum", "-z", "--log-file=/tmp/rsync.log"]).unwrap();
        assert_eq!(options.extras, vec!["--checksum", "-z"]);
        assert_eq!(options.log_file.as_deref(), Some("/tmp/rsync.log"));
        assert!(!options.recursive);
    }
}
