//! Command safety validator.
//!
//! Classifies a command as allowed, allowed with warnings, or blocked. The
//! policy is deny-by-default: a command whose effect cannot be worked out
//! from its tokens is blocked rather than passed with a warning.
//!
//! Checks run in a fixed order and stop at the first block:
//!
//! 1. translate host paths and expand `~`, `$HOME`, `$USER`, `$PWD`
//! 2. deny-pattern scan (fork bombs, remote execution, privilege
//!    escalation, raw devices, protected deletions, recursive permission
//!    changes), before any path is resolved
//! 3. unclassifiable constructs and unrecognized verbs
//! 4. mount-mode check on every mutation target
//! 5. containment check on every referenced path
//! 6. soft-risk warnings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::patterns;
use crate::sandbox::mounts::{MountMode, MountTable, normalize_lexical};
use crate::shell::lexer::{self, Segment, Token, TokenKind};
use crate::shell::translate::{Direction, PathTranslator};

/// Outcome of validating one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub allowed: bool,
    /// The command after translation and expansion; the only form ever executed.
    pub sanitized_command: String,
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

impl ValidationResult {
    pub fn allow(sanitized_command: String, warnings: Vec<String>) -> Self {
        Self {
            allowed: true,
            sanitized_command,
            warnings,
            blocked_reason: None,
        }
    }

    pub fn block(sanitized_command: String, blocked: &Blocked) -> Self {
        Self {
            allowed: false,
            sanitized_command,
            warnings: Vec::new(),
            blocked_reason: Some(blocked.to_string()),
        }
    }
}

/// Category of a blocked command. Its label leads every blocked reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyCategory {
    EmptyCommand,
    ForbiddenDeletion,
    ForkBomb,
    RawDeviceAccess,
    RemoteCodeExecution,
    PrivilegeEscalation,
    RecursivePermissionChange,
    UnclassifiableConstruct,
    UnrecognizedCommand,
    ReadOnlyMount,
    OutsideMounts,
}

impl DenyCategory {
    pub fn label(self) -> &'static str {
        match self {
            DenyCategory::EmptyCommand => "empty command",
            DenyCategory::ForbiddenDeletion => "forbidden deletion",
            DenyCategory::ForkBomb => "fork bomb",
            DenyCategory::RawDeviceAccess => "raw device access",
            DenyCategory::RemoteCodeExecution => "remote code execution",
            DenyCategory::PrivilegeEscalation => "privilege escalation",
            DenyCategory::RecursivePermissionChange => "recursive permission change",
            DenyCategory::UnclassifiableConstruct => "unclassifiable construct",
            DenyCategory::UnrecognizedCommand => "unrecognized command",
            DenyCategory::ReadOnlyMount => "write attempted on read-only mount",
            DenyCategory::OutsideMounts => "path outside mounted directories",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub category: DenyCategory,
    pub detail: String,
}

impl Blocked {
    pub fn new(category: DenyCategory, detail: impl Into<String>) -> Self {
        Self {
            category,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Blocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            f.write_str(self.category.label())
        } else {
            write!(f, "{}: {}", self.category.label(), self.detail)
        }
    }
}

/// A path mentioned by a command, as written and as resolved in the sandbox.
#[derive(Debug, Clone)]
struct PathRef {
    text: String,
    resolved: PathBuf,
}

/// What one simple command does to the filesystem.
#[derive(Debug, Default)]
struct SegmentEffect {
    verb: String,
    writes: Vec<PathRef>,
    deletes: Vec<PathRef>,
    paths: Vec<PathRef>,
    recursive_roots: Vec<PathRef>,
    fan_out: Option<String>,
}

/// Stateless classifier; safe to share across concurrent requests.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    translator: PathTranslator,
    working_dir: PathBuf,
    sandbox_user: String,
}

impl CommandValidator {
    pub fn new(
        translator: PathTranslator,
        working_dir: impl Into<PathBuf>,
        sandbox_user: impl Into<String>,
    ) -> Self {
        Self {
            translator,
            working_dir: working_dir.into(),
            sandbox_user: sandbox_user.into(),
        }
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn mounts(&self) -> &MountTable {
        self.translator.mounts()
    }

    pub fn validate(&self, command: &str) -> ValidationResult {
        let command = command.trim();
        if command.is_empty() {
            return ValidationResult::block(
                String::new(),
                &Blocked::new(DenyCategory::EmptyCommand, ""),
            );
        }

        let translated = self.translator.translate(command, Direction::HostToSandbox);
        let (sanitized, unresolved) = self.expand_variables(&translated);

        match self.classify(&sanitized, &unresolved) {
            Ok(warnings) => {
                debug!(command = %sanitized, warnings = warnings.len(), "Command allowed");
                ValidationResult::allow(sanitized, warnings)
            }
            Err(blocked) => {
                debug!(command = %sanitized, reason = %blocked, "Command blocked");
                ValidationResult::block(sanitized, &blocked)
            }
        }
    }

    fn classify(&self, command: &str, unresolved: &[String]) -> Result<Vec<String>, Blocked> {
        let tokens = lexer::tokenize(command);
        let segments = lexer::segments(&tokens);

        self.deny_scan(command, &tokens, &segments)?;
        reject_unclassifiable(&tokens, &segments, unresolved)?;

        let mut cwd = self.working_dir.clone();
        let mut effects = Vec::with_capacity(segments.len());
        for segment in &segments {
            effects.push(self.analyze(segment, &mut cwd)?);
        }

        for effect in &effects {
            self.check_mount_modes(effect)?;
        }
        for effect in &effects {
            self.check_containment(effect)?;
        }

        let mut warnings = Vec::new();
        for effect in &effects {
            self.soft_risks(effect, &mut warnings);
        }
        Ok(warnings)
    }

    // Sanitize

    /// Expand the variables with a known sandbox value. Anything else is
    /// left in place and reported back as unresolved.
    fn expand_variables(&self, command: &str) -> (String, Vec<String>) {
        let mut out = String::with_capacity(command.len());
        let mut unresolved = Vec::new();
        let mut in_single = false;
        let mut in_double = false;
        let mut chars = command.char_indices().peekable();

        while let Some((i, ch)) = chars.next() {
            match ch {
                '\\' if !in_single => {
                    out.push(ch);
                    if let Some((_, next)) = chars.next() {
                        out.push(next);
                    }
                    continue;
                }
                '\'' if !in_double => in_single = !in_single,
                '"' if !in_single => in_double = !in_double,
                '$' if !in_single => {
                    let rest = &command[i + 1..];
                    if let Some((name, consumed)) = variable_reference(rest) {
                        match self.variable(name) {
                            Some(value) => out.push_str(&value),
                            None => {
                                unresolved.push(format!("${}", &rest[..consumed]));
                                out.push_str(&command[i..i + 1 + consumed]);
                            }
                        }
                        let end = i + 1 + consumed;
                        while chars.next_if(|&(j, _)| j < end).is_some() {}
                        continue;
                    }
                }
                _ => {}
            }
            out.push(ch);
        }

        (out, unresolved)
    }

    fn variable(&self, name: &str) -> Option<String> {
        match name {
            "HOME" => Some(self.translator.sandbox_home().display().to_string()),
            "USER" | "LOGNAME" => Some(self.sandbox_user.clone()),
            "PWD" => Some(self.working_dir.display().to_string()),
            _ => None,
        }
    }

    // Deny-pattern scan

    fn deny_scan(
        &self,
        command: &str,
        tokens: &[Token],
        segments: &[Segment],
    ) -> Result<(), Blocked> {
        if patterns::is_fork_bomb(command) {
            return Err(Blocked::new(
                DenyCategory::ForkBomb,
                "self-replicating shell function",
            ));
        }

        scan_remote_execution(command, tokens, segments)?;

        for segment in segments {
            for verb in command_verbs(segment) {
                if patterns::PRIVILEGE_VERBS.contains(&verb.as_str()) {
                    return Err(Blocked::new(DenyCategory::PrivilegeEscalation, verb));
                }
            }
        }

        scan_raw_devices(command, segments)?;
        self.scan_deletions(segments)?;
        self.scan_permission_changes(segments)
    }

    fn scan_deletions(&self, segments: &[Segment]) -> Result<(), Blocked> {
        for segment in segments {
            let Some(verb) = verb_name(segment) else {
                continue;
            };
            if !patterns::DELETE_VERBS.contains(&verb.as_str()) {
                continue;
            }
            for operand in operands(&verb, segment.args()) {
                let text = lexer::unquote(&operand.text);
                if self.is_protected_deletion(&text) {
                    return Err(Blocked::new(DenyCategory::ForbiddenDeletion, text));
                }
            }
        }
        Ok(())
    }

    /// `/`, the sandbox home, system directories and anything holding a
    /// mount root. A glob over a mount root (`workspace/*`) is left to the
    /// mount-mode check.
    fn is_protected_deletion(&self, text: &str) -> bool {
        let globbed = text.strip_suffix("/*").or_else(|| text.strip_suffix("/.*"));
        let base = match globbed {
            Some("") => "/",
            Some(base) => base,
            None => text,
        };
        let resolved = resolve(&self.working_dir, base);

        if resolved == Path::new("/")
            || resolved == self.translator.sandbox_home()
            || patterns::SYSTEM_DIRS.iter().any(|dir| resolved == Path::new(dir))
        {
            return true;
        }

        let mounts = self.mounts();
        if globbed.is_some() {
            mounts.is_ancestor_of_mount(&resolved)
                && mounts.iter().all(|m| m.sandbox_path != resolved)
        } else {
            mounts.is_ancestor_of_mount(&resolved)
        }
    }

    fn scan_permission_changes(&self, segments: &[Segment]) -> Result<(), Blocked> {
        for segment in segments {
            let Some(verb) = verb_name(segment) else {
                continue;
            };
            if !patterns::PERMISSION_VERBS.contains(&verb.as_str())
                || !has_flag(segment.args(), 'R', "--recursive")
            {
                continue;
            }
            for operand in operands(&verb, segment.args()).into_iter().skip(1) {
                let text = lexer::unquote(&operand.text);
                let resolved = resolve(&self.working_dir, &text);
                let display = resolved.display().to_string();
                if resolved == Path::new("/") || patterns::under_system_dir(&display) {
                    return Err(Blocked::new(
                        DenyCategory::RecursivePermissionChange,
                        format!("{verb} -R {text}"),
                    ));
                }
            }
        }
        Ok(())
    }

    // Per-segment analysis

    fn analyze(&self, segment: &Segment, cwd: &mut PathBuf) -> Result<SegmentEffect, Blocked> {
        let mut effect = SegmentEffect::default();

        for (op, target) in &segment.redirects {
            let Some(target) = target else {
                continue;
            };
            if op.text.ends_with("<<<") {
                continue;
            }
            let path = path_ref(cwd, &target.text);
            if op.text.contains('>') {
                effect.writes.push(path.clone());
            }
            effect.paths.push(path);
        }

        let Some(verb) = verb_name(segment) else {
            return Ok(effect);
        };
        let args = segment.args();

        if verb == "xargs" {
            let (inner, inner_args) = xargs_inner(args);
            let inner = inner.unwrap_or_else(|| "echo".to_string());
            if patterns::is_mutating_verb(&inner) {
                return Err(Blocked::new(
                    DenyCategory::UnclassifiableConstruct,
                    format!("xargs feeds computed operands to {inner}"),
                ));
            }
            effect.verb = inner.clone();
            self.classify_verb(&inner, inner_args, cwd, &mut effect)?;
            effect.fan_out = Some(inner);
        } else {
            effect.verb = verb.clone();
            self.classify_verb(&verb, args, cwd, &mut effect)?;
        }

        Ok(effect)
    }

    fn classify_verb(
        &self,
        verb: &str,
        args: &[Token],
        cwd: &mut PathBuf,
        effect: &mut SegmentEffect,
    ) -> Result<(), Blocked> {
        collect_paths(verb, args, cwd, effect);

        if patterns::is_mutating_verb(verb) {
            mutation_targets(verb, args, cwd, effect);
        } else if patterns::is_read_only_verb(verb) {
            read_only_side_effects(verb, args, cwd, effect)?;
        } else {
            return Err(Blocked::new(DenyCategory::UnrecognizedCommand, verb));
        }

        if verb == "cd" {
            let target = match operands(verb, args).first() {
                Some(token) => path_ref(cwd, &token.text),
                None => PathRef {
                    text: "~".to_string(),
                    resolved: self.translator.sandbox_home().to_path_buf(),
                },
            };
            *cwd = target.resolved.clone();
            effect.paths.push(target);
        }
        Ok(())
    }

    // Checks over analyzed segments

    fn check_mount_modes(&self, effect: &SegmentEffect) -> Result<(), Blocked> {
        for write in &effect.writes {
            if is_exempt(&write.resolved) {
                continue;
            }
            if let Some(mount) = self.mounts().resolve(&write.resolved)
                && mount.mode == MountMode::ReadOnly
            {
                return Err(Blocked::new(
                    DenyCategory::ReadOnlyMount,
                    format!(
                        "{} ({} is read-only)",
                        write.text,
                        mount.sandbox_path.display()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_containment(&self, effect: &SegmentEffect) -> Result<(), Blocked> {
        for path in effect.paths.iter().chain(&effect.writes) {
            if is_exempt(&path.resolved) {
                continue;
            }
            if self.mounts().resolve(&path.resolved).is_none() {
                let detail = if path.text == path.resolved.display().to_string() {
                    path.text.clone()
                } else {
                    format!("{} resolves to {}", path.text, path.resolved.display())
                };
                return Err(Blocked::new(DenyCategory::OutsideMounts, detail));
            }
        }
        Ok(())
    }

    fn soft_risks(&self, effect: &SegmentEffect, warnings: &mut Vec<String>) {
        let mounts = self.mounts();
        let in_writable = |path: &PathRef| {
            mounts
                .resolve(&path.resolved)
                .is_some_and(|m| m.mode == MountMode::ReadWrite)
        };

        if patterns::DESTRUCTIVE_VERBS.contains(&effect.verb.as_str())
            && effect.writes.iter().any(in_writable)
        {
            warnings.push(format!(
                "destructive command '{}' modifies files in the read-write mount",
                effect.verb
            ));
        }

        for delete in &effect.deletes {
            if delete.text.contains(['*', '?']) && in_writable(delete) {
                warnings.push(format!(
                    "wildcard delete in the read-write mount: {}",
                    delete.text
                ));
            }
        }

        for root in &effect.recursive_roots {
            if mounts.iter().any(|m| m.sandbox_path == root.resolved) {
                warnings.push(format!(
                    "unbounded recursive scan of mount root {}",
                    root.resolved.display()
                ));
            }
        }

        if let Some(inner) = &effect.fan_out {
            warnings.push(format!("xargs runs '{inner}' once per batch of input"));
        }
    }
}

/// Parse the reference after a `$`: `{NAME}`, `NAME`, or a special
/// parameter. Returns the name and the number of bytes consumed.
fn variable_reference(rest: &str) -> Option<(&str, usize)> {
    if let Some(inner) = rest.strip_prefix('{') {
        let end = inner.find('}')?;
        return Some((&inner[..end], end + 2));
    }
    let first = rest.chars().next()?;
    if first.is_ascii_alphabetic() || first == '_' {
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        return Some((&rest[..len], len));
    }
    if first.is_ascii_digit() || "?#@*!$-".contains(first) {
        return Some((&rest[..1], 1));
    }
    None
}

fn scan_remote_execution(
    command: &str,
    tokens: &[Token],
    segments: &[Segment],
) -> Result<(), Blocked> {
    if patterns::FETCH_TO_INTERPRETER.is_match(command) {
        return Err(Blocked::new(
            DenyCategory::RemoteCodeExecution,
            "downloaded content piped into an interpreter",
        ));
    }

    let verbs: Vec<String> = segments.iter().flat_map(command_verbs).collect();
    if verbs.iter().any(|v| v == "eval") {
        return Err(Blocked::new(DenyCategory::RemoteCodeExecution, "eval"));
    }

    let fetches = verbs
        .iter()
        .any(|v| patterns::FETCH_VERBS.contains(&v.as_str()))
        || tokens.iter().any(|t| {
            t.kind == TokenKind::Substitution && patterns::FETCH_WORD.is_match(&t.text)
        });
    if fetches && let Some(interpreter) = verbs.iter().find(|v| patterns::is_interpreter(v)) {
        return Err(Blocked::new(
            DenyCategory::RemoteCodeExecution,
            format!("downloaded content executed by {interpreter}"),
        ));
    }
    Ok(())
}

fn scan_raw_devices(command: &str, segments: &[Segment]) -> Result<(), Blocked> {
    if let Some(found) = patterns::BLOCK_DEVICE.find(command) {
        return Err(Blocked::new(DenyCategory::RawDeviceAccess, found.as_str()));
    }
    for segment in segments {
        for verb in command_verbs(segment) {
            if patterns::is_device_verb(&verb) {
                return Err(Blocked::new(DenyCategory::RawDeviceAccess, verb));
            }
        }
        let dd_outputs: Vec<String> = match verb_name(segment).as_deref() {
            Some("dd") => segment
                .args()
                .iter()
                .filter_map(|t| lexer::unquote(&t.text).strip_prefix("of=").map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let redirect_targets = segment
            .redirects
            .iter()
            .filter_map(|(_, target)| target.as_ref().map(|t| lexer::unquote(&t.text)));
        for target in dd_outputs.into_iter().chain(redirect_targets) {
            if target.starts_with("/dev/") && !patterns::is_pseudo_device(&target) {
                return Err(Blocked::new(DenyCategory::RawDeviceAccess, target));
            }
        }
    }
    Ok(())
}

fn reject_unclassifiable(
    tokens: &[Token],
    segments: &[Segment],
    unresolved: &[String],
) -> Result<(), Blocked> {
    let block = |detail: String| Err(Blocked::new(DenyCategory::UnclassifiableConstruct, detail));

    if let Some(var) = unresolved.first() {
        return block(format!("unresolved variable {var}"));
    }

    for token in tokens {
        if token.kind == TokenKind::Substitution {
            return block(format!("command substitution {}", token.text));
        }
        if token.kind == TokenKind::PathLike && token.text.starts_with('~') {
            return block(format!("unresolved home directory {}", token.text));
        }
        if token.kind == TokenKind::Operator {
            continue;
        }
        // Both rewrite the word after these checks have looked at it.
        if lexer::has_dollar_quote(&token.text) {
            return block(format!("escape-decoded quoting {}", token.text));
        }
        if lexer::has_brace_expansion(&token.text) {
            return block(format!("brace expansion {}", token.text));
        }
    }

    for segment in segments {
        if segment.background {
            return block("background job".to_string());
        }
        if segment
            .redirects
            .iter()
            .any(|(op, _)| op.text.contains("<<") && !op.text.contains("<<<"))
        {
            return block("here-document".to_string());
        }
        if let Some(verb) = segment.verb() {
            if patterns::ASSIGNMENT.is_match(&verb.text) {
                return block(format!("environment assignment {}", verb.text));
            }
            if verb.text.starts_with(['(', '{']) || verb.text.contains("()") {
                return block(format!("subshell or function definition {}", verb.text));
            }
        }
        for verb in command_verbs(segment) {
            if patterns::SHELLS.contains(&verb.as_str()) {
                return block(format!("nested shell {verb}"));
            }
        }
    }
    Ok(())
}

fn read_only_side_effects(
    verb: &str,
    args: &[Token],
    cwd: &Path,
    effect: &mut SegmentEffect,
) -> Result<(), Blocked> {
    let default_root = || vec![path_ref(cwd, ".")];

    match verb {
        "sed" => {
            let in_place = args.iter().any(|a| {
                a.kind == TokenKind::Flag
                    && (a.text.starts_with("--in-place")
                        || (!a.text.starts_with("--") && a.text.contains('i')))
            });
            if in_place {
                let skip = non_path_indices(verb, args);
                for (i, arg) in args.iter().enumerate() {
                    if is_operand(verb, args, i) && !skip.contains(&i) {
                        effect.writes.push(path_ref(cwd, &arg.text));
                    }
                }
            }
        }
        "find" => {
            let mut starts: Vec<PathRef> = find_start_paths(args)
                .into_iter()
                .map(|t| path_ref(cwd, &t.text))
                .collect();
            if starts.is_empty() {
                starts = default_root();
            }
            effect.paths.extend(starts.iter().cloned());

            let mut mutates = false;
            let mut iter = args.iter().peekable();
            while let Some(arg) = iter.next() {
                match arg.text.as_str() {
                    "-delete" => mutates = true,
                    "-exec" | "-execdir" | "-ok" | "-okdir" => {
                        if let Some(inner) = iter.next() {
                            let inner = basename(&lexer::unquote(&inner.text));
                            if patterns::is_mutating_verb(&inner) {
                                mutates = true;
                            } else if !patterns::is_read_only_verb(&inner) {
                                return Err(Blocked::new(DenyCategory::UnrecognizedCommand, inner));
                            }
                        }
                    }
                    "-fprint" | "-fprint0" | "-fprintf" | "-fls" => {
                        if let Some(file) = iter.next() {
                            effect.writes.push(path_ref(cwd, &file.text));
                        }
                    }
                    _ => {}
                }
            }
            if mutates {
                effect.writes.extend(starts.iter().cloned());
                if args.iter().any(|a| a.text == "-delete") {
                    effect.deletes.extend(starts.iter().cloned());
                }
            }
            if !args.iter().any(|a| a.text == "-maxdepth") {
                effect.recursive_roots.extend(starts);
            }
        }
        "awk" => {
            let script = operands(verb, args).into_iter().next();
            let uses_file = args.iter().any(|a| a.text == "-f");
            if !uses_file
                && let Some(script) = script
                && patterns::AWK_SIDE_EFFECT.is_match(&lexer::unquote(&script.text))
            {
                return Err(Blocked::new(
                    DenyCategory::UnclassifiableConstruct,
                    "awk program runs commands or writes files",
                ));
            }
        }
        "sort" => {
            if let Some(out) = flag_value(args, &["-o", "--output"]) {
                effect.writes.push(path_ref(cwd, &out));
            }
        }
        "unzip" => {
            let listing = ['l', 'v', 't', 'Z', 'p', 'c']
                .iter()
                .any(|&c| has_flag(args, c, ""));
            if !listing {
                let dest = flag_value(args, &["-d"]).unwrap_or_else(|| ".".to_string());
                effect.writes.push(path_ref(cwd, &dest));
            }
        }
        "ls" => {
            if has_flag(args, 'R', "--recursive") {
                effect.recursive_roots.extend(operand_paths_or(verb, args, cwd, default_root));
            }
        }
        "du" => {
            let bounded = has_flag(args, 's', "--summarize")
                || has_flag(args, 'd', "--max-depth")
                || args.iter().any(|a| a.text.starts_with("--max-depth="));
            if !bounded {
                effect.recursive_roots.extend(operand_paths_or(verb, args, cwd, default_root));
            }
        }
        "grep" | "egrep" | "fgrep" => {
            if has_flag(args, 'r', "--recursive") || has_flag(args, 'R', "--dereference-recursive") {
                effect.recursive_roots.extend(operand_paths_or(verb, args, cwd, default_root));
            }
        }
        "rg" => {
            if !args.iter().any(|a| a.text.starts_with("--max-depth")) {
                effect.recursive_roots.extend(operand_paths_or(verb, args, cwd, default_root));
            }
        }
        "tree" => {
            if !args.iter().any(|a| a.text == "-L") {
                effect.recursive_roots.extend(operand_paths_or(verb, args, cwd, default_root));
            }
            if let Some(out) = flag_value(args, &["-o"]) {
                effect.writes.push(path_ref(cwd, &out));
            }
        }
        _ => {}
    }
    Ok(())
}

fn mutation_targets(verb: &str, args: &[Token], cwd: &Path, effect: &mut SegmentEffect) {
    let ops: Vec<String> = operands(verb, args)
        .into_iter()
        .map(|t| t.text.clone())
        .collect();
    let target_dir = flag_value(args, patterns::TARGET_DIR_FLAGS);

    let targets: Vec<String> = match verb {
        "mv" => ops.iter().cloned().chain(target_dir).collect(),
        "cp" | "ln" => match (target_dir, ops.as_slice()) {
            (Some(dir), _) => vec![dir],
            (None, [.., _, last]) => vec![last.clone()],
            (None, [_]) if verb == "ln" => vec![".".to_string()],
            _ => Vec::new(),
        },
        "chmod" | "chown" | "chgrp" => {
            if args.iter().any(|a| a.text.starts_with("--reference")) {
                ops
            } else {
                ops.into_iter().skip(1).collect()
            }
        }
        "dd" => args
            .iter()
            .filter_map(|t| lexer::unquote(&t.text).strip_prefix("of=").map(str::to_string))
            .collect(),
        _ => ops,
    };

    let resolved: Vec<PathRef> = targets.iter().map(|t| path_ref(cwd, t)).collect();
    if patterns::DELETE_VERBS.contains(&verb) {
        effect.deletes.extend(resolved.iter().cloned());
    }
    effect.writes.extend(resolved);
}

/// Every path-like argument, except operands that are patterns or text.
fn collect_paths(verb: &str, args: &[Token], cwd: &Path, effect: &mut SegmentEffect) {
    let skip = non_path_indices(verb, args);
    for (i, arg) in args.iter().enumerate() {
        if skip.contains(&i) {
            continue;
        }
        let candidate = match arg.kind {
            TokenKind::PathLike => Some(arg.text.clone()),
            TokenKind::Quoted => {
                let text = lexer::unquote(&arg.text);
                lexer::is_path_like(&text).then_some(text)
            }
            TokenKind::Flag | TokenKind::Literal => embedded_path(&arg.text),
            _ => None,
        };
        if let Some(candidate) = candidate {
            effect.paths.push(path_ref(cwd, &candidate));
        }
    }
}

/// Argument indices holding patterns, scripts or plain text.
fn non_path_indices(verb: &str, args: &[Token]) -> Vec<usize> {
    let mut out = Vec::new();
    match verb {
        "echo" | "printf" | "expr" => out.extend(0..args.len()),
        "grep" | "egrep" | "fgrep" | "rg" | "sed" | "awk" | "jq" => {
            let explicit = ["-e", "--regexp", "--expression"];
            let mut has_explicit = false;
            for (i, arg) in args.iter().enumerate() {
                if explicit.contains(&arg.text.as_str()) {
                    has_explicit = true;
                    out.push(i + 1);
                }
                if verb == "awk" && arg.text == "-f" {
                    has_explicit = true;
                }
            }
            if !has_explicit
                && let Some(first) = (0..args.len()).find(|&i| is_operand(verb, args, i))
            {
                out.push(first);
            }
        }
        "find" => {
            let pattern_predicates = [
                "-name", "-iname", "-path", "-ipath", "-wholename", "-iwholename", "-regex",
                "-iregex", "-lname", "-ilname",
            ];
            for (i, arg) in args.iter().enumerate() {
                if pattern_predicates.contains(&arg.text.as_str()) {
                    out.push(i + 1);
                }
            }
        }
        _ => {}
    }
    out
}

/// Whether `args[index]` is an operand rather than a flag or a flag's value.
fn is_operand(verb: &str, args: &[Token], index: usize) -> bool {
    let value_flags = patterns::value_flags(verb);
    let mut end_of_options = false;
    let mut skip_next = false;
    for (i, arg) in args.iter().enumerate() {
        let operand = if skip_next {
            skip_next = false;
            false
        } else if !end_of_options && arg.kind == TokenKind::Flag {
            if arg.text == "--" {
                end_of_options = true;
            } else if value_flags.contains(&arg.text.as_str()) {
                skip_next = true;
            }
            false
        } else {
            arg.text != "-"
        };
        if i == index {
            return operand;
        }
    }
    false
}

fn operands<'a>(verb: &str, args: &'a [Token]) -> Vec<&'a Token> {
    (0..args.len())
        .filter(|&i| is_operand(verb, args, i))
        .map(|i| &args[i])
        .collect()
}

fn operand_paths_or(
    verb: &str,
    args: &[Token],
    cwd: &Path,
    default: impl FnOnce() -> Vec<PathRef>,
) -> Vec<PathRef> {
    let skip = non_path_indices(verb, args);
    let paths: Vec<PathRef> = (0..args.len())
        .filter(|&i| is_operand(verb, args, i) && !skip.contains(&i))
        .map(|i| path_ref(cwd, &args[i].text))
        .collect();
    if paths.is_empty() { default() } else { paths }
}

/// The value of `-x VALUE`, `--long VALUE`, or `--long=VALUE`.
fn flag_value(args: &[Token], names: &[&str]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if names.contains(&arg.text.as_str()) {
            return iter.next().map(|v| lexer::unquote(&v.text));
        }
        for name in names.iter().filter(|n| n.starts_with("--")) {
            if let Some(value) = arg
                .text
                .strip_prefix(*name)
                .and_then(|r| r.strip_prefix('='))
            {
                return Some(lexer::unquote(value));
            }
        }
    }
    None
}

/// Whether a short flag cluster contains `short`, or `long` is present.
fn has_flag(args: &[Token], short: char, long: &str) -> bool {
    args.iter().filter(|a| a.kind == TokenKind::Flag).any(|a| {
        if let Some(name) = a.text.strip_prefix("--") {
            !long.is_empty() && long.strip_prefix("--") == Some(name)
        } else {
            a.text[1..].contains(short)
        }
    })
}

/// Path values carried inside a word: `--file=/x`, `if=/x`, `-o/x`.
fn embedded_path(text: &str) -> Option<String> {
    let text = lexer::unquote(text);
    if let Some((key, value)) = text.split_once('=')
        && !key.is_empty()
        && lexer::is_path_like(value)
    {
        return Some(value.to_string());
    }
    if let Some(rest) = text.strip_prefix('-')
        && !rest.starts_with('-')
        && rest.len() > 1
    {
        let value = &rest[1..];
        if value.starts_with(['/', '~']) {
            return Some(value.to_string());
        }
    }
    None
}

fn find_start_paths(args: &[Token]) -> Vec<&Token> {
    let mut out = Vec::new();
    for arg in args {
        if out.is_empty() && matches!(arg.text.as_str(), "-H" | "-L" | "-P") {
            continue;
        }
        if arg.kind == TokenKind::Flag || matches!(arg.text.as_str(), "(" | "\\(" | "!") {
            break;
        }
        out.push(arg);
    }
    out
}

/// Inner verb of `xargs [flags] verb args...`, and its arguments.
fn xargs_inner(args: &[Token]) -> (Option<String>, &[Token]) {
    match (0..args.len()).find(|&i| is_operand("xargs", args, i)) {
        Some(i) => (
            Some(basename(&lexer::unquote(&args[i].text))),
            &args[i + 1..],
        ),
        None => (None, &[]),
    }
}

/// Verbs a segment will run: its own, plus those run through `xargs` or
/// `find -exec`.
fn command_verbs(segment: &Segment) -> Vec<String> {
    let Some(verb) = verb_name(segment) else {
        return Vec::new();
    };
    let mut verbs = vec![verb.clone()];
    let args = segment.args();
    if verb == "xargs"
        && let (Some(inner), _) = xargs_inner(args)
    {
        verbs.push(inner);
    }
    if verb == "find" {
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if matches!(arg.text.as_str(), "-exec" | "-execdir" | "-ok" | "-okdir")
                && let Some(inner) = iter.next()
            {
                verbs.push(basename(&lexer::unquote(&inner.text)));
            }
        }
    }
    verbs
}

fn verb_name(segment: &Segment) -> Option<String> {
    segment
        .verb()
        .map(|token| basename(&lexer::unquote(&token.text)))
}

fn basename(text: &str) -> String {
    match text.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => text.to_string(),
    }
}

fn resolve(cwd: &Path, text: &str) -> PathBuf {
    let path = Path::new(text);
    if path.is_absolute() {
        normalize_lexical(path)
    } else {
        normalize_lexical(&cwd.join(path))
    }
}

fn path_ref(cwd: &Path, raw: &str) -> PathRef {
    let text = lexer::unquote(raw);
    let resolved = resolve(cwd, &text);
    PathRef { text, resolved }
}

fn is_exempt(path: &Path) -> bool {
    path.to_str().is_some_and(patterns::is_pseudo_device)
}
