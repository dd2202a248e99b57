//! Fixed verb tables and deny patterns used by the command validator.
//!
//! These lists are best-effort triage. The read-only bind mounts applied when
//! the sandbox is created are the real backstop.

use once_cell::sync::Lazy;
use regex::Regex;

/// Verbs that only read the filesystem.
pub const READ_ONLY_VERBS: &[&str] = &[
    // Viewing
    "cat",
    "head",
    "tail",
    "less",
    "more",
    "tac",
    "nl",
    "strings",
    "od",
    "hexdump",
    "xxd",
    // Listing and search
    "ls",
    "tree",
    "find",
    "locate",
    "grep",
    "egrep",
    "fgrep",
    "rg",
    "du",
    "df",
    "stat",
    "file",
    "realpath",
    "readlink",
    "basename",
    "dirname",
    "pwd",
    "cd",
    // Text processing
    "wc",
    "sort",
    "uniq",
    "cut",
    "tr",
    "awk",
    "sed",
    "column",
    "rev",
    "paste",
    "join",
    "diff",
    "comm",
    "cmp",
    "jq",
    // Checksums and archives (listing only)
    "md5sum",
    "sha1sum",
    "sha256sum",
    "unzip",
    "zipinfo",
    // Misc
    "echo",
    "printf",
    "date",
    "cal",
    "printenv",
    "id",
    "whoami",
    "hostname",
    "uname",
    "true",
    "false",
    "test",
    "[",
    "expr",
    "seq",
    "sleep",
    "xargs",
];

/// Verbs that modify the filesystem.
pub const MUTATING_VERBS: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "touch", "mkdir", "ln", "truncate", "shred", "chmod", "chown",
    "chgrp", "tee", "dd",
];

/// Verbs that delete their operands.
pub const DELETE_VERBS: &[&str] = &["rm", "rmdir", "shred"];

/// Verbs surfaced as destructive in soft-risk warnings.
pub const DESTRUCTIVE_VERBS: &[&str] = &["rm", "rmdir", "shred", "truncate", "mv"];

/// Verbs whose first operand is a mode or owner, not a path.
pub const PERMISSION_VERBS: &[&str] = &["chmod", "chown", "chgrp"];

/// Verbs that fetch content from the network.
pub const FETCH_VERBS: &[&str] = &["curl", "wget", "fetch", "nc", "ncat", "netcat"];

/// Verbs that execute code handed to them.
pub const INTERPRETERS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "python", "python2", "python3", "perl", "ruby",
    "node", "php", "source", ".",
];

/// Shells whose invocation hides a nested command line from analysis.
pub const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "fish"];

pub const PRIVILEGE_VERBS: &[&str] = &["sudo", "su", "doas", "chroot", "nsenter", "pkexec"];

/// Verbs that format or partition block devices.
pub const DEVICE_VERBS: &[&str] = &["fdisk", "sfdisk", "parted", "wipefs", "mkswap"];

/// Top-level system directories never deleted or recursively re-permissioned.
pub const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/usr", "/var", "/bin", "/sbin", "/lib", "/lib64", "/boot", "/root", "/sys", "/proc",
    "/dev", "/opt",
];

/// Pseudo-devices that are safe to read from or redirect into.
pub const PSEUDO_DEVICES: &[&str] = &["/dev/null", "/dev/stdin", "/dev/stdout", "/dev/stderr"];

/// Flags that take a separate value argument, per verb.
pub fn value_flags(verb: &str) -> &'static [&'static str] {
    match verb {
        "truncate" => &["-s", "--size", "-r", "--reference"],
        "mkdir" => &["-m", "--mode"],
        "touch" => &["-d", "--date", "-t", "-r", "--reference"],
        "cp" | "mv" | "ln" => &["-S", "--suffix", "-t", "--target-directory"],
        "chmod" | "chown" | "chgrp" => &["--reference"],
        "shred" => &["-n", "--iterations", "-s", "--size"],
        "xargs" => &["-I", "-n", "-P", "-L", "-d", "-s", "-E", "-a"],
        "sed" => &["-e", "--expression", "-f", "--file", "-l"],
        "grep" | "egrep" | "fgrep" => &["-e", "--regexp", "-f", "--file", "-m", "-A", "-B", "-C"],
        "rg" => &["-e", "--regexp", "-f", "--file", "-g", "--glob", "-t", "--type", "-m"],
        "awk" => &["-f", "-v", "-F"],
        "sort" => &["-o", "--output", "-k", "--key", "-t", "-S", "-T"],
        "unzip" => &["-d", "-x"],
        "head" | "tail" => &["-n", "-c"],
        "cut" => &["-d", "-f", "-c", "-b"],
        "du" => &["-d", "--max-depth"],
        "tree" => &["-L", "-P", "-I", "-o"],
        _ => &[],
    }
}

/// Flags that name a target directory (`cp -t dir src...`).
pub const TARGET_DIR_FLAGS: &[&str] = &["-t", "--target-directory"];

pub fn is_read_only_verb(verb: &str) -> bool {
    READ_ONLY_VERBS.contains(&verb)
}

pub fn is_mutating_verb(verb: &str) -> bool {
    MUTATING_VERBS.contains(&verb)
}

pub fn is_interpreter(verb: &str) -> bool {
    INTERPRETERS.contains(&verb)
        || verb
            .strip_prefix("python")
            .is_some_and(|version| version.chars().all(|c| c.is_ascii_digit() || c == '.'))
}

pub fn is_device_verb(verb: &str) -> bool {
    DEVICE_VERBS.contains(&verb) || verb == "mkfs" || verb.starts_with("mkfs.")
}

/// Whether `path` is a system directory or lives under one.
pub fn under_system_dir(path: &str) -> bool {
    SYSTEM_DIRS.iter().any(|dir| {
        path == *dir
            || path
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

pub fn is_pseudo_device(path: &str) -> bool {
    PSEUDO_DEVICES.contains(&path) || path.starts_with("/dev/fd/")
}

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        // Covered by the `built_in_patterns_compile` test.
        Err(err) => panic!("invalid built-in pattern {pattern:?}: {err}"),
    }
}

/// Block devices: disks, partitions and device-mapper nodes.
pub static BLOCK_DEVICE: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"/dev/(sd[a-z]|hd[a-z]|nvme[0-9]|vd[a-z]|xvd[a-z]|mmcblk[0-9]|disk[0-9]|mapper/|k?mem\b|port\b)",
    )
});

/// A shell function definition: captures the name and the body.
pub static FUNCTION_DEF: Lazy<Regex> = Lazy::new(|| {
    compile(r"([A-Za-z_:.][A-Za-z0-9_:.]*)\s*\(\s*\)\s*\{(.*)\}")
});

/// Fetch piped or chained into an interpreter, checked on raw text so it also
/// sees inside substitutions.
pub static FETCH_TO_INTERPRETER: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)\b(curl|wget|fetch|nc|ncat|netcat)\b.*(\||&&|;)\s*(sudo\s+)?(sh|bash|zsh|dash|ksh|fish|python[0-9.]*|perl|ruby|node|php|source|\.)(\s|$|\))",
    )
});

/// A fetch verb anywhere in a word, used on substitution bodies.
pub static FETCH_WORD: Lazy<Regex> =
    Lazy::new(|| compile(r"\b(curl|wget|fetch|nc|ncat|netcat)\b"));

/// awk programs that spawn commands or write files.
pub static AWK_SIDE_EFFECT: Lazy<Regex> =
    Lazy::new(|| compile(r#"system\s*\(|getline|\|\s*"|>\s*""#));

/// A leading `NAME=value` environment assignment.
pub static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| compile(r"^[A-Za-z_][A-Za-z0-9_]*\+?="));

/// Whether `command` defines a function that pipes into or backgrounds itself.
pub fn is_fork_bomb(command: &str) -> bool {
    FUNCTION_DEF.captures_iter(command).any(|caps| {
        let name = &caps[1];
        let body: String = caps[2].chars().filter(|c| !c.is_whitespace()).collect();
        body.contains(&format!("{name}|{name}")) || body.contains(&format!("{name}&"))
    })
}
