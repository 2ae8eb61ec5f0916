//! Operations: an immutable, analysed candidate shell command.
//!
//! An [`Operation`] is built once from raw text, a category hint and a working
//! directory. Construction never fails: text that cannot be lexed is kept with
//! its parse error so that classification can fail closed on it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::lexer::{self, RedirectKind, Segment, Word};

/// Closed set of operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    ReadOnly,
    FilesystemMutation,
    Network,
    ProcessControl,
    PackageManagement,
    Unknown,
}

impl OperationCategory {
    /// Merge precedence across pipeline segments; the highest wins.
    pub fn precedence(self) -> u8 {
        match self {
            Self::ReadOnly => 0,
            Self::FilesystemMutation => 1,
            Self::Network => 2,
            Self::ProcessControl => 3,
            Self::PackageManagement => 4,
            Self::Unknown => 5,
        }
    }

    /// Whether the category can be executed inside a disposable path overlay.
    pub fn supports_overlay(self) -> bool {
        matches!(self, Self::ReadOnly | Self::FilesystemMutation)
    }

    /// Whether observed filesystem changes of this category may be inverted.
    pub fn declares_reversible_diff(self) -> bool {
        matches!(self, Self::FilesystemMutation | Self::Network)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::FilesystemMutation => "filesystem-mutation",
            Self::Network => "network",
            Self::ProcessControl => "process-control",
            Self::PackageManagement => "package-management",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "read-only" | "readonly" => Ok(Self::ReadOnly),
            "filesystem-mutation" | "filesystem" | "fs" => Ok(Self::FilesystemMutation),
            "network" => Ok(Self::Network),
            "process-control" | "process" => Ok(Self::ProcessControl),
            "package-management" | "package" => Ok(Self::PackageManagement),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown operation category: {other}")),
        }
    }
}

/// What a single simple command does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Read,
    ChangeDir,
    Delete,
    Move,
    Copy,
    Create,
    Link,
    Chmod,
    Edit,
    Write,
    Extract,
    Archive,
    Install,
    Remove,
    Query,
    Fetch,
    Connect,
    Signal,
    Service,
    Power,
    /// Runs code the analyser cannot see (`sh -c`, `find -exec`, interpreters).
    Execute,
    Other,
}

impl CommandAction {
    fn category(self) -> OperationCategory {
        use CommandAction::*;
        match self {
            Read | ChangeDir | Query => OperationCategory::ReadOnly,
            Delete | Move | Copy | Create | Link | Chmod | Edit | Write | Extract | Archive => {
                OperationCategory::FilesystemMutation
            }
            Install | Remove => OperationCategory::PackageManagement,
            Fetch | Connect => OperationCategory::Network,
            Signal | Service | Power => OperationCategory::ProcessControl,
            Execute | Other => OperationCategory::Unknown,
        }
    }
}

/// Analysis of one simple command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    /// Program basename after unwrapping wrappers.
    pub program: String,
    pub subcommand: Option<String>,
    pub args: Vec<String>,
    pub action: CommandAction,
    pub category: OperationCategory,
    /// Paths the command mutates.
    pub targets: Vec<PathBuf>,
    /// Paths the command only reads.
    pub reads: Vec<PathBuf>,
    /// Move/copy/link destination.
    pub destination: Option<PathBuf>,
    pub redirect_writes: Vec<PathBuf>,
    pub packages: Vec<String>,
    pub processes: Vec<String>,
    pub hosts: Vec<String>,
    pub recursive: bool,
    pub escalated: bool,
    pub opaque: bool,
    /// Arguments are supplied at run time (`xargs`).
    pub indirect_args: bool,
    pub piped_input: bool,
    pub substitution: bool,
    pub expansion: bool,
}

impl Command {
    /// Every path this command may change. Copy sources are excluded.
    pub fn mutated_paths(&self) -> impl Iterator<Item = &PathBuf> {
        let sources = if self.action == CommandAction::Copy {
            &[][..]
        } else {
            &self.targets[..]
        };
        sources
            .iter()
            .chain(self.destination.iter())
            .chain(self.redirect_writes.iter())
    }
}

/// Resources an operation declares it may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationResources {
    pub paths: BTreeSet<PathBuf>,
    pub reads: BTreeSet<PathBuf>,
    /// Destination directories mapped to the entry names placed into them.
    pub containers: BTreeMap<PathBuf, BTreeSet<String>>,
    pub packages: BTreeSet<String>,
    pub processes: BTreeSet<String>,
    pub hosts: BTreeSet<String>,
}

impl OperationResources {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
            && self.containers.is_empty()
            && self.packages.is_empty()
            && self.processes.is_empty()
    }
}

/// An analysed candidate operation. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    raw: String,
    normalized: String,
    cwd: PathBuf,
    declared_category: Option<OperationCategory>,
    category: OperationCategory,
    #[serde(skip)]
    segments: Vec<Segment>,
    commands: Vec<Command>,
    parse_error: Option<String>,
    resources: OperationResources,
}

impl Operation {
    /// Analyse `raw` relative to `cwd`. The hint is recorded, never trusted.
    pub fn new(
        raw: impl Into<String>,
        declared_category: Option<OperationCategory>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        let raw = raw.into();
        let cwd = cwd.into();
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));

        let parsed = lexer::tokenize(&raw).and_then(lexer::split_segments);
        let (segments, parse_error) = match parsed {
            Ok(segments) if segments.is_empty() => {
                (Vec::new(), Some("empty command".to_string()))
            }
            Ok(segments) => (segments, None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        let mut analyser = Analyser {
            cwd: cwd.clone(),
            home,
        };
        let commands: Vec<Command> = segments.iter().map(|s| analyser.command(s)).collect();

        let category = if parse_error.is_some() {
            OperationCategory::Unknown
        } else {
            commands
                .iter()
                .map(|c| c.category)
                .max_by_key(|c| c.precedence())
                .unwrap_or(OperationCategory::Unknown)
        };

        let normalized = if parse_error.is_some() {
            raw.split_whitespace().collect::<Vec<_>>().join(" ")
        } else {
            lexer::render(&segments)
        };
        let resources = collect_resources(&commands);

        Self {
            raw,
            normalized,
            cwd,
            declared_category,
            category,
            segments,
            commands,
            parse_error,
            resources,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Canonical executable form.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn category(&self) -> OperationCategory {
        self.category
    }

    pub fn declared_category(&self) -> Option<OperationCategory> {
        self.declared_category
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    pub fn resources(&self) -> &OperationResources {
        &self.resources
    }

    pub fn escalates(&self) -> bool {
        self.commands.iter().any(|c| c.escalated)
    }

    pub fn is_opaque(&self) -> bool {
        self.commands.iter().any(|c| c.opaque)
    }

    pub fn has_substitution(&self) -> bool {
        self.commands.iter().any(|c| c.substitution)
    }

    pub fn has_expansion(&self) -> bool {
        self.commands.iter().any(|c| c.expansion)
    }

    pub fn writes_via_redirect(&self) -> bool {
        self.commands.iter().any(|c| !c.redirect_writes.is_empty())
    }

    /// SHA-256 over the executable form and working directory.
    ///
    /// Confirmation and preflight records are bound to this digest.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.cwd.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Whether a Simulation preflight can meaningfully run this operation.
    pub fn preflight_available(&self) -> bool {
        self.parse_error.is_none()
            && self.category.supports_overlay()
            && !self.is_opaque()
            && !self.escalates()
            && !(self.resources.paths.is_empty() && self.resources.containers.is_empty())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized)
    }
}

fn collect_resources(commands: &[Command]) -> OperationResources {
    let mut res = OperationResources::default();
    for cmd in commands {
        let container_dest = matches!(cmd.action, CommandAction::Move | CommandAction::Copy)
            .then_some(cmd.destination.as_ref())
            .flatten();
        if let Some(dest) = container_dest {
            let names = res.containers.entry(dest.clone()).or_default();
            for src in &cmd.targets {
                if let Some(name) = src.file_name() {
                    names.insert(name.to_string_lossy().into_owned());
                }
            }
        } else if let Some(dest) = &cmd.destination {
            res.paths.insert(dest.clone());
        }
        // Copy sources are read, move sources are mutated.
        if cmd.action == CommandAction::Copy {
            res.reads.extend(cmd.targets.iter().cloned());
        } else {
            res.paths.extend(cmd.targets.iter().cloned());
        }
        res.paths.extend(cmd.redirect_writes.iter().cloned());
        res.reads.extend(cmd.reads.iter().cloned());
        res.packages.extend(cmd.packages.iter().cloned());
        res.processes.extend(cmd.processes.iter().cloned());
        res.hosts.extend(cmd.hosts.iter().cloned());
    }
    res
}

const PRIVILEGE_WRAPPERS: &[&str] = &["sudo", "doas", "pkexec", "su", "run0"];
const PLAIN_WRAPPERS: &[&str] = &["env", "nice", "nohup", "time", "timeout", "xargs", "ionice", "stdbuf", "command"];
const SHELLS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "csh", "tcsh", "python", "python3", "perl", "ruby",
    "node", "php", "lua", "eval", "exec", "source", ".",
];
const READ_PROGRAMS: &[&str] = &[
    "ls", "cat", "echo", "printf", "pwd", "whoami", "id", "date", "head", "tail", "grep", "egrep",
    "fgrep", "rg", "wc", "sort", "uniq", "stat", "file", "du", "df", "which", "type", "uname",
    "hostname", "ps", "top", "tree", "less", "more", "diff", "cmp", "true", "false", "basename",
    "dirname", "realpath", "readlink", "cut", "tr", "column", "jq", "free", "uptime", "lsblk",
    "lsof", "md5sum", "sha1sum", "sha256sum", "test", "[", "seq", "nl", "od", "xxd", "hexdump",
    "strings", "locate", "whereis", "history", "printenv", "groups", "w", "who",
    "journalctl", "dmesg", "ss", "netstat", "ip", "lscpu", "nproc",
];
const PACKAGE_MANAGERS: &[&str] = &[
    "apt", "apt-get", "aptitude", "dnf", "yum", "zypper", "apk", "brew", "snap", "pip", "pip3",
    "npm", "pnpm", "yarn", "cargo", "gem", "pacman", "flatpak", "port",
];
const NETWORK_PROGRAMS: &[&str] = &[
    "curl", "wget", "ssh", "scp", "sftp", "rsync", "nc", "ncat", "netcat", "telnet", "ftp", "ping",
    "traceroute", "dig", "nslookup", "host",
];

/// Whether `program` runs code given to it (shells and script interpreters).
pub fn is_interpreter(program: &str) -> bool {
    SHELLS.contains(&program)
}

struct Analyser {
    cwd: PathBuf,
    home: PathBuf,
}

impl Analyser {
    fn command(&mut self, segment: &Segment) -> Command {
        let mut words: &[Word] = &segment.words;

        // Leading NAME=value assignments.
        while let Some(first) = words.first() {
            if words.len() > 1 && is_assignment(&first.value) {
                words = &words[1..];
            } else {
                break;
            }
        }

        let mut cmd = Command {
            program: String::new(),
            subcommand: None,
            args: Vec::new(),
            action: CommandAction::Other,
            category: OperationCategory::Unknown,
            targets: Vec::new(),
            reads: Vec::new(),
            destination: None,
            redirect_writes: Vec::new(),
            packages: Vec::new(),
            processes: Vec::new(),
            hosts: Vec::new(),
            recursive: false,
            escalated: false,
            opaque: false,
            indirect_args: false,
            piped_input: segment.piped_from_previous(),
            substitution: segment
                .words
                .iter()
                .chain(segment.redirects.iter().map(|r| &r.target))
                .any(|w| w.substitution),
            expansion: segment
                .words
                .iter()
                .chain(segment.redirects.iter().map(|r| &r.target))
                .any(|w| w.expansion),
        };

        // Unwrap wrapper programs.
        loop {
            let Some(first) = words.first() else { break };
            let name = basename(&first.value);
            if PRIVILEGE_WRAPPERS.contains(&name.as_str()) {
                cmd.escalated = true;
                if name == "su" {
                    cmd.opaque = true;
                }
                words = skip_options(&words[1..], &["-u", "-g", "-C", "-D", "-h", "-p", "-r", "-t", "-U", "--user", "--group"]);
            } else if PLAIN_WRAPPERS.contains(&name.as_str()) {
                if name == "xargs" {
                    cmd.indirect_args = true;
                }
                let rest = skip_options(&words[1..], &["-n", "-u", "-I", "-P", "-d", "-L", "-s", "-E", "-k", "--signal", "-c", "-o", "-i", "-e"]);
                words = match name.as_str() {
                    "env" => {
                        let mut r = rest;
                        while r.first().map(|w| is_assignment(&w.value)).unwrap_or(false) {
                            r = &r[1..];
                        }
                        r
                    }
                    // timeout DURATION cmd
                    "timeout" if !rest.is_empty() => &rest[1..],
                    _ => rest,
                };
            } else {
                break;
            }
        }

        let Some(first) = words.first() else {
            cmd.opaque = cmd.escalated || cmd.indirect_args;
            cmd.redirect_writes = self.redirect_writes(segment);
            cmd.category = if cmd.redirect_writes.is_empty() {
                OperationCategory::Unknown
            } else {
                OperationCategory::FilesystemMutation
            };
            return cmd;
        };

        cmd.program = basename(&first.value);
        cmd.args = words[1..].iter().map(|w| w.value.clone()).collect();
        let args = &words[1..];

        self.analyse_program(&mut cmd, args);

        cmd.redirect_writes = self.redirect_writes(segment);
        for r in &segment.redirects {
            if r.op.kind == RedirectKind::Read {
                if let Some(p) = self.path_of(&r.target) {
                    cmd.reads.push(p);
                }
            }
        }

        cmd.category = cmd.action.category();
        if cmd.category == OperationCategory::ReadOnly && !cmd.redirect_writes.is_empty() {
            cmd.category = OperationCategory::FilesystemMutation;
        }
        if cmd.opaque {
            cmd.category = OperationCategory::Unknown;
        }
        cmd
    }

    fn redirect_writes(&self, segment: &Segment) -> Vec<PathBuf> {
        segment
            .redirects
            .iter()
            .filter(|r| r.op.kind.writes_path())
            .filter_map(|r| self.path_of(&r.target))
            .collect()
    }

    fn analyse_program(&mut self, cmd: &mut Command, args: &[Word]) {
        let program = cmd.program.clone();
        let positional = positionals(args, &[]);

        match program.as_str() {
            "cd" => {
                cmd.action = CommandAction::ChangeDir;
                match positional.first() {
                    Some(w) if w.value == "-" => {}
                    Some(w) => {
                        if let Some(p) = self.path_of(w) {
                            self.cwd = p;
                        }
                    }
                    None => self.cwd = self.home.clone(),
                }
            }
            "rm" | "rmdir" | "unlink" | "shred" => {
                cmd.action = CommandAction::Delete;
                cmd.recursive = program == "rm"
                    && args.iter().take_while(|w| w.value != "--").any(|w| {
                        w.value == "--recursive"
                            || (w.value.starts_with('-')
                                && !w.value.starts_with("--")
                                && (w.value.contains('r') || w.value.contains('R')))
                    });
                cmd.targets = self.paths_of(&positional);
            }
            "mv" | "cp" | "ln" | "install" => {
                cmd.action = match program.as_str() {
                    "mv" => CommandAction::Move,
                    "cp" => CommandAction::Copy,
                    "ln" => CommandAction::Link,
                    _ => CommandAction::Create,
                };
                cmd.recursive = program == "cp"
                    && args.iter().any(|w| {
                        w.value == "--recursive"
                            || w.value == "-a"
                            || (w.is_flag() && !w.value.starts_with("--") && (w.value.contains('r') || w.value.contains('R')))
                    });
                let target_dir = option_value(args, &["-t", "--target-directory"]);
                let positional = positionals(args, &["-t", "--target-directory", "-S", "--suffix", "-m", "-o", "-g"]);
                let mut paths = self.paths_of(&positional);
                let dest = match target_dir.and_then(|w| self.path_of(w)) {
                    Some(dir) => Some(dir),
                    None if paths.len() >= 2 => paths.pop(),
                    None => None,
                };
                if program == "ln" {
                    // `ln -s target link`: only the link is created.
                    cmd.destination = dest;
                    if cmd.destination.is_none() {
                        cmd.targets = paths;
                    } else {
                        cmd.reads = paths;
                    }
                } else {
                    cmd.targets = paths;
                    cmd.destination = dest;
                }
            }
            "touch" | "mkdir" | "mkfifo" | "mknod" | "truncate" => {
                cmd.action = CommandAction::Create;
                let positional = positionals(args, &["-m", "--mode", "-s", "--size", "-d", "-t", "-r"]);
                cmd.targets = self.paths_of(&positional);
            }
            "chmod" | "chown" | "chgrp" | "chattr" | "setfacl" => {
                cmd.action = CommandAction::Chmod;
                cmd.recursive = args.iter().any(|w| w.value == "-R" || w.value == "--recursive");
                cmd.targets = self.paths_of(positional.get(1..).unwrap_or(&[]));
            }
            "sed" => {
                let in_place = args.iter().any(|w| {
                    w.value == "--in-place"
                        || w.value.starts_with("--in-place=")
                        || (w.is_flag() && !w.value.starts_with("--") && w.value[1..].contains('i'))
                });
                let has_script_flag = args.iter().any(|w| w.value == "-e" || w.value == "-f");
                let positional = positionals(args, &["-e", "-f", "-l"]);
                let files = if has_script_flag { &positional[..] } else { positional.get(1..).unwrap_or(&[]) };
                let paths = self.paths_of(files);
                let scripts: Vec<&str> = if has_script_flag {
                    args.iter()
                        .enumerate()
                        .filter(|(_, w)| w.value == "-e")
                        .filter_map(|(i, _)| args.get(i + 1))
                        .map(|w| w.value.as_str())
                        .collect()
                } else {
                    positional.first().map(|w| w.value.as_str()).into_iter().collect()
                };
                let mut effects = SedEffects::default();
                for script in scripts {
                    effects.scan(script);
                }
                let unseen_script = args
                    .iter()
                    .any(|w| w.value == "-f" || w.value == "--file" || w.value.starts_with("--file="));
                if effects.executes || unseen_script {
                    cmd.action = CommandAction::Execute;
                    cmd.opaque = true;
                    cmd.reads = paths;
                } else if in_place {
                    cmd.action = CommandAction::Edit;
                    cmd.targets = paths;
                } else if !effects.writes.is_empty() {
                    cmd.action = CommandAction::Write;
                    cmd.reads = paths;
                } else {
                    cmd.action = CommandAction::Read;
                    cmd.reads = paths;
                }
                cmd.targets
                    .extend(effects.writes.iter().filter_map(|f| {
                        let path = self.resolve(f, false);
                        (!is_pseudo_device(&path)).then_some(path)
                    }));
            }
            "tee" => {
                cmd.action = CommandAction::Write;
                cmd.targets = self.paths_of(&positional);
            }
            "dd" => {
                cmd.action = CommandAction::Read;
                for w in args {
                    if let Some(rest) = w.value.strip_prefix("of=") {
                        cmd.action = CommandAction::Write;
                        cmd.targets.push(self.resolve(rest, false));
                    } else if let Some(rest) = w.value.strip_prefix("if=") {
                        cmd.reads.push(self.resolve(rest, false));
                    }
                }
            }
            "tar" => self.analyse_tar(cmd, args),
            "unzip" | "gunzip" | "bunzip2" | "unxz" | "7z" => {
                cmd.action = CommandAction::Extract;
                let dir = option_value(args, &["-d"]).and_then(|w| self.path_of(w));
                cmd.targets.push(dir.unwrap_or_else(|| self.cwd.clone()));
                cmd.reads = self.paths_of(&positionals(args, &["-d"]));
            }
            "zip" | "gzip" | "bzip2" | "xz" => {
                cmd.action = CommandAction::Archive;
                cmd.targets = self.paths_of(&positional);
            }
            "find" => {
                let starts: Vec<&Word> = args
                    .iter()
                    .take_while(|w| !w.value.starts_with('-') && w.value != "(" && w.value != "!")
                    .collect();
                let roots: Vec<PathBuf> = if starts.is_empty() {
                    vec![self.cwd.clone()]
                } else {
                    starts.iter().filter_map(|w| self.path_of(w)).collect()
                };
                if args.iter().any(|w| matches!(w.value.as_str(), "-exec" | "-execdir" | "-ok" | "-okdir")) {
                    cmd.action = CommandAction::Execute;
                    cmd.opaque = true;
                    cmd.reads = roots;
                } else if args.iter().any(|w| w.value == "-delete") {
                    cmd.action = CommandAction::Delete;
                    cmd.recursive = true;
                    cmd.targets = roots;
                } else {
                    let outputs: Vec<PathBuf> = args
                        .iter()
                        .enumerate()
                        .filter(|(_, w)| matches!(w.value.as_str(), "-fprint" | "-fprint0" | "-fls" | "-fprintf"))
                        .filter_map(|(i, _)| args.get(i + 1))
                        .filter_map(|w| self.path_of(w))
                        .collect();
                    cmd.action = if outputs.is_empty() { CommandAction::Read } else { CommandAction::Write };
                    cmd.targets = outputs;
                    cmd.reads = roots;
                }
            }
            "git" => self.analyse_git(cmd, args),
            "kill" | "pkill" | "killall" => {
                cmd.action = CommandAction::Signal;
                let positional = positionals(args, &["-s", "-n", "--signal", "-u", "-U", "-g"]);
                cmd.processes = positional.iter().map(|w| w.value.clone()).collect();
            }
            "systemctl" | "service" => {
                let positional = positionals(args, &[]);
                let (verb, units): (Option<&Word>, Vec<&Word>) = if program == "service" {
                    (positional.get(1).copied(), positional.iter().take(1).copied().collect())
                } else {
                    (positional.first().copied(), positional.iter().skip(1).copied().collect())
                };
                let verb = verb.map(|w| w.value.as_str()).unwrap_or("");
                cmd.subcommand = Some(verb.to_string());
                cmd.action = match verb {
                    "reboot" | "poweroff" | "halt" | "suspend" | "hibernate" | "kexec" => CommandAction::Power,
                    "status" | "show" | "is-active" | "is-enabled" | "is-failed" | "cat" | "list-units"
                    | "list-unit-files" | "list-timers" | "" => CommandAction::Query,
                    _ => CommandAction::Service,
                };
                cmd.processes = units.iter().map(|w| w.value.clone()).collect();
            }
            "shutdown" | "reboot" | "halt" | "poweroff" | "init" | "telinit" => {
                cmd.action = CommandAction::Power;
            }
            "renice" => {
                cmd.action = CommandAction::Signal;
                cmd.processes = positional.iter().skip(1).map(|w| w.value.clone()).collect();
            }
            "mkfs" | "wipefs" | "fdisk" | "sfdisk" | "parted" | "mkswap" | "blkdiscard" => {
                cmd.action = CommandAction::Write;
                cmd.targets = self.paths_of(&positional);
            }
            p if p.starts_with("mkfs.") => {
                cmd.action = CommandAction::Write;
                cmd.targets = self.paths_of(&positional);
            }
            p if PACKAGE_MANAGERS.contains(&p) => self.analyse_package(cmd, args),
            p if NETWORK_PROGRAMS.contains(&p) => self.analyse_network(cmd, args),
            p if SHELLS.contains(&p) => {
                cmd.action = CommandAction::Execute;
                cmd.opaque = true;
            }
            "sort" => {
                let value_flags = ["-o", "--output", "-k", "--key", "-t", "--field-separator", "-S", "--buffer-size", "-T", "--temporary-directory"];
                let output = args.iter().enumerate().find_map(|(i, w)| match w.value.as_str() {
                    "-o" | "--output" => args.get(i + 1).map(|n| self.resolve(&n.value, n.tilde)),
                    v if v.starts_with("--output=") => Some(self.resolve(&v[9..], false)),
                    v if v.starts_with("-o") && v.len() > 2 => Some(self.resolve(&v[2..], false)),
                    _ => None,
                });
                cmd.reads = self.paths_of(&positionals(args, &value_flags));
                match output {
                    Some(target) => {
                        cmd.action = CommandAction::Write;
                        cmd.targets.push(target);
                    }
                    None => cmd.action = CommandAction::Read,
                }
            }
            "uniq" => {
                // `uniq INPUT OUTPUT` writes OUTPUT.
                let positional = positionals(args, &["-f", "--skip-fields", "-s", "--skip-chars", "-w", "--check-chars"]);
                cmd.reads = self.paths_of(positional.get(..1).unwrap_or(&[]));
                match positional.get(1).and_then(|w| self.path_of(w)) {
                    Some(target) => {
                        cmd.action = CommandAction::Write;
                        cmd.targets.push(target);
                    }
                    None => cmd.action = CommandAction::Read,
                }
            }
            "hostname" => {
                let sets = !positionals(args, &[]).is_empty()
                    || args.iter().any(|w| matches!(w.value.as_str(), "-F" | "--file" | "-b" | "--boot"));
                cmd.action = if sets { CommandAction::Service } else { CommandAction::Read };
            }
            "date" => {
                // `date -s ..` and `date MMDDhhmm` set the clock.
                let sets = args.iter().any(|w| {
                    w.value == "-s" || w.value == "--set" || w.value.starts_with("--set=")
                }) || positionals(args, &["-d", "--date", "-f", "--file", "-r", "--reference"])
                    .iter()
                    .any(|w| !w.value.starts_with('+'));
                cmd.action = if sets { CommandAction::Service } else { CommandAction::Read };
            }
            p if READ_PROGRAMS.contains(&p) => {
                cmd.action = CommandAction::Read;
                cmd.reads = self.paths_of(&positional);
            }
            _ => {
                cmd.action = CommandAction::Other;
            }
        }
    }

    fn analyse_tar(&self, cmd: &mut Command, args: &[Word]) {
        let mut extract = false;
        let mut create = false;
        let mut archive: Option<PathBuf> = None;
        let mut dir: Option<PathBuf> = None;
        let mut i = 0;
        while i < args.len() {
            let v = args[i].value.as_str();
            let short = if let Some(s) = v.strip_prefix("--") {
                match s {
                    "extract" | "get" => extract = true,
                    "create" | "append" | "update" => create = true,
                    s if s.starts_with("file=") => archive = Some(self.resolve(&s[5..], false)),
                    s if s.starts_with("directory=") => dir = Some(self.resolve(&s[10..], false)),
                    "file" | "directory" => {
                        if let Some(next) = args.get(i + 1) {
                            let p = self.resolve(&next.value, next.tilde);
                            if s == "file" { archive = Some(p) } else { dir = Some(p) }
                            i += 1;
                        }
                    }
                    _ => {}
                }
                None
            } else if let Some(s) = v.strip_prefix('-') {
                Some(s)
            } else if i == 0 {
                Some(v)
            } else {
                None
            };
            if let Some(flags) = short {
                if flags == "C" {
                    if let Some(next) = args.get(i + 1) {
                        dir = self.path_of(next);
                        i += 1;
                    }
                } else {
                    extract |= flags.contains('x');
                    create |= flags.contains('c') || flags.contains('r') || flags.contains('u');
                    if flags.ends_with('f') {
                        if let Some(next) = args.get(i + 1) {
                            archive = self.path_of(next);
                            i += 1;
                        }
                    }
                }
            }
            i += 1;
        }
        if extract {
            cmd.action = CommandAction::Extract;
            cmd.targets.push(dir.unwrap_or_else(|| self.cwd.clone()));
            cmd.reads.extend(archive);
        } else if create {
            cmd.action = CommandAction::Archive;
            cmd.targets.extend(archive);
        } else {
            cmd.action = CommandAction::Read;
            cmd.reads.extend(archive);
        }
    }

    fn analyse_git(&self, cmd: &mut Command, args: &[Word]) {
        let positional = positionals(args, &["-C", "-c", "--git-dir", "--work-tree"]);
        let sub = positional.first().map(|w| w.value.clone()).unwrap_or_default();
        let rest = positional.get(1..).unwrap_or(&[]);
        cmd.subcommand = Some(sub.clone());
        let after = positional
            .first()
            .and_then(|first| args.iter().position(|w| std::ptr::eq(w, *first)))
            .map(|i| &args[i + 1..])
            .unwrap_or(&[]);
        let has = |flags: &[&str]| {
            after.iter().any(|w| {
                flags.contains(&w.value.as_str())
                    || flags.iter().any(|f| f.starts_with("--") && w.value.starts_with(&format!("{f}=")))
            })
        };
        match sub.as_str() {
            "status" | "log" | "diff" | "show" | "rev-parse" | "ls-files" | "blame" | "describe"
            | "shortlog" | "reflog" | "grep" | "" => {
                cmd.action = CommandAction::Query;
            }
            "branch" => {
                let listing = has(&["-l", "--list", "-a", "--all", "-r", "--remotes", "--show-current", "--contains", "--merged", "--no-merged"]);
                let mutating = has(&[
                    "-d", "-D", "--delete", "-m", "-M", "--move", "-c", "-C", "--copy", "-f", "--force",
                    "-u", "--set-upstream-to", "--unset-upstream", "--edit-description",
                ]);
                cmd.action = if !mutating && (rest.is_empty() || listing) {
                    CommandAction::Query
                } else {
                    CommandAction::Edit
                };
                if cmd.action == CommandAction::Edit {
                    cmd.targets.push(self.cwd.join(".git"));
                }
            }
            "tag" => {
                let listing = has(&["-l", "--list", "--contains", "--points-at", "--merged", "--no-merged", "-v", "--verify"]);
                let mutating = has(&["-d", "--delete", "-a", "--annotate", "-s", "--sign", "-f", "--force", "-m", "--message", "-F", "--file"]);
                cmd.action = if !mutating && (rest.is_empty() || listing) {
                    CommandAction::Query
                } else {
                    CommandAction::Edit
                };
                if cmd.action == CommandAction::Edit {
                    cmd.targets.push(self.cwd.join(".git"));
                }
            }
            "remote" => {
                let verb = rest.first().map(|w| w.value.as_str()).unwrap_or("");
                cmd.action = match verb {
                    "" | "show" | "get-url" => CommandAction::Query,
                    _ => CommandAction::Edit,
                };
                if cmd.action == CommandAction::Edit {
                    cmd.targets.push(self.cwd.join(".git"));
                }
            }
            "config" => {
                let reading = has(&["--get", "--get-all", "--get-regexp", "--get-urlmatch", "-l", "--list"]);
                let mutating = has(&[
                    "--unset", "--unset-all", "--add", "--replace-all", "--rename-section", "--remove-section",
                    "-e", "--edit",
                ]);
                let words = positionals(after, &["-f", "--file", "--blob", "--type", "--default"]);
                cmd.action = if !mutating && (reading || words.len() <= 1) {
                    CommandAction::Query
                } else {
                    CommandAction::Edit
                };
                if cmd.action == CommandAction::Edit {
                    let target = if has(&["--global"]) {
                        self.home.join(".gitconfig")
                    } else if has(&["--system"]) {
                        PathBuf::from("/etc/gitconfig")
                    } else if let Some(file) = option_value(after, &["-f", "--file"]) {
                        self.resolve(&file.value, file.tilde)
                    } else {
                        self.cwd.join(".git/config")
                    };
                    cmd.targets.push(target);
                }
            }
            "clone" => {
                cmd.action = CommandAction::Fetch;
                if let Some(url) = rest.first() {
                    cmd.hosts.extend(host_of(&url.value));
                    let dir = match rest.get(1) {
                        Some(w) => self.path_of(w),
                        None => {
                            let name = url
                                .value
                                .trim_end_matches('/')
                                .rsplit(['/', ':'])
                                .next()
                                .unwrap_or("")
                                .trim_end_matches(".git")
                                .to_string();
                            (!name.is_empty()).then(|| self.cwd.join(name))
                        }
                    };
                    cmd.targets.extend(dir);
                }
            }
            "fetch" | "pull" | "push" | "ls-remote" => {
                cmd.action = CommandAction::Fetch;
                cmd.hosts.extend(rest.iter().filter_map(|w| host_of(&w.value)));
                if sub == "pull" {
                    cmd.targets.push(self.cwd.clone());
                }
            }
            _ => {
                cmd.action = CommandAction::Edit;
                cmd.targets.push(self.cwd.clone());
            }
        }
    }

    fn analyse_package(&self, cmd: &mut Command, args: &[Word]) {
        let value_flags = ["-r", "-c", "-t", "-i", "--target", "--index-url", "--root", "--prefix", "-e", "--registry"];
        let positional = positionals(args, &value_flags);

        if cmd.program == "pacman" {
            let op = args.iter().find(|w| w.value.starts_with('-') && !w.value.starts_with("--"));
            let op = op.map(|w| w.value.as_str()).unwrap_or("");
            cmd.subcommand = Some(op.to_string());
            cmd.action = if op.starts_with("-R") {
                CommandAction::Remove
            } else if op.starts_with("-Q") || op.starts_with("-Ss") || op.starts_with("-Si") {
                CommandAction::Query
            } else if op.starts_with("-S") || op.starts_with("-U") {
                CommandAction::Install
            } else {
                CommandAction::Query
            };
            cmd.packages = positional.iter().map(|w| package_name(&w.value)).collect();
            return;
        }

        let verb = positional.first().map(|w| w.value.clone()).unwrap_or_default();
        cmd.subcommand = Some(verb.clone());
        cmd.action = match verb.as_str() {
            "install" | "add" | "reinstall" | "upgrade" | "update" | "dist-upgrade" | "full-upgrade"
            | "i" | "in" | "up" | "refresh" | "link" => CommandAction::Install,
            "remove" | "uninstall" | "purge" | "erase" | "autoremove" | "del" | "rm" | "un" | "unlink"
            | "r" => CommandAction::Remove,
            "search" | "list" | "show" | "info" | "policy" | "query" | "outdated" | "view" | "ls"
            | "check" | "freeze" | "madison" | "depends" | "rdepends" | "why" | "doctor" => CommandAction::Query,
            _ => CommandAction::Execute,
        };
        if cmd.action == CommandAction::Execute {
            // `cargo build`, `npm run ..` execute project code.
            cmd.opaque = true;
        }
        cmd.packages = positional
            .iter()
            .skip(1)
            .map(|w| package_name(&w.value))
            .filter(|p| !p.is_empty())
            .collect();
    }

    fn analyse_network(&self, cmd: &mut Command, args: &[Word]) {
        let program = cmd.program.clone();
        match program.as_str() {
            "curl" | "wget" => {
                cmd.action = CommandAction::Fetch;
                let value_flags = [
                    "-o", "--output", "-O", "--output-document", "-P", "--directory-prefix", "-H", "--header",
                    "-d", "--data", "-X", "--request", "-u", "--user", "-A", "--user-agent", "-e", "-T",
                    "--upload-file", "-F", "--form", "-b", "-c", "-m", "--max-time",
                ];
                let curl = program == "curl";
                // curl's -O is a bare flag.
                let value_flags: Vec<&str> = value_flags
                    .iter()
                    .copied()
                    .filter(|f| !(curl && *f == "-O"))
                    .collect();
                for (i, w) in args.iter().enumerate() {
                    let next = args.get(i + 1);
                    match w.value.as_str() {
                        "-o" | "--output" if curl => cmd.targets.extend(next.and_then(|n| self.path_of(n))),
                        "-O" | "--output-document" if !curl => {
                            if let Some(n) = next.filter(|n| n.value != "-") {
                                cmd.targets.extend(self.path_of(n));
                            }
                        }
                        "-P" | "--directory-prefix" if !curl => cmd.targets.extend(next.and_then(|n| self.path_of(n))),
                        "-O" | "--remote-name" if curl => cmd.targets.push(self.cwd.clone()),
                        _ => {}
                    }
                }
                let urls: Vec<&Word> = positionals(args, &value_flags);
                for url in &urls {
                    cmd.hosts.extend(host_of(&url.value));
                }
                if !curl && cmd.targets.is_empty() && !urls.is_empty() {
                    cmd.targets.push(self.cwd.clone());
                }
            }
            "scp" | "rsync" | "sftp" => {
                cmd.action = CommandAction::Fetch;
                let positional = positionals(args, &["-P", "-i", "-e", "-o", "-F", "--rsh"]);
                let mut remote_source = false;
                for (i, w) in positional.iter().enumerate() {
                    if let Some(h) = remote_host(&w.value) {
                        cmd.hosts.push(h);
                        if i + 1 < positional.len() {
                            remote_source = true;
                        }
                    }
                }
                if let Some(last) = positional.last() {
                    if remote_host(&last.value).is_none() && remote_source {
                        cmd.targets.extend(self.path_of(last));
                    }
                }
            }
            _ => {
                cmd.action = CommandAction::Connect;
                let value_flags = [
                    "-p", "-i", "-l", "-o", "-F", "-J", "-L", "-R", "-D", "-b", "-c", "-E", "-m", "-O",
                    "-Q", "-S", "-W", "-w", "-t", "-q", "-s", "-I",
                ];
                let positional = positionals(args, &value_flags);
                let host = match program.as_str() {
                    "ping" | "traceroute" | "dig" | "nslookup" | "host" => positional.last(),
                    _ => positional.first(),
                };
                if let Some(h) = host {
                    let v = h.value.trim_start_matches('@');
                    let v = v.rsplit('@').next().unwrap_or(v);
                    cmd.hosts.push(v.to_ascii_lowercase());
                }
            }
        }
    }

    fn paths_of(&self, words: &[&Word]) -> Vec<PathBuf> {
        words.iter().filter_map(|w| self.path_of(w)).collect()
    }

    fn path_of(&self, word: &Word) -> Option<PathBuf> {
        if word.value.is_empty() {
            return None;
        }
        let mut literal = word.value.as_str();
        if word.glob || word.expansion || word.substitution {
            let cut = literal
                .find(['*', '?', '[', '$', '`'])
                .unwrap_or(literal.len());
            literal = match literal[..cut].rfind('/') {
                Some(0) => "/",
                Some(slash) => &literal[..slash],
                None => "",
            };
        }
        let path = self.resolve(literal, word.tilde);
        if is_pseudo_device(&path) {
            None
        } else {
            Some(path)
        }
    }

    fn resolve(&self, value: &str, tilde: bool) -> PathBuf {
        let candidate = if tilde && (value == "~" || value.starts_with("~/")) {
            self.home.join(value.trim_start_matches('~').trim_start_matches('/'))
        } else if value.is_empty() {
            self.cwd.clone()
        } else {
            self.cwd.join(value)
        };
        normalize_lexically(&candidate)
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("/");
                }
                if out.as_os_str().is_empty() {
                    out.push("/");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push("/");
    }
    out
}

/// Character devices that are safe to use as-is inside any sandbox.
pub fn is_pseudo_device(path: &Path) -> bool {
    matches!(
        path.to_str(),
        Some("/dev/null" | "/dev/stdout" | "/dev/stderr" | "/dev/stdin" | "/dev/tty" | "/dev/zero" | "/dev/random" | "/dev/urandom")
    ) || path.starts_with("/dev/fd")
        || path.starts_with("/proc/self/fd")
}

fn basename(program: &str) -> String {
    program.rsplit('/').next().unwrap_or(program).to_string()
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Drop leading option words (and the values of `value_flags`).
fn skip_options<'a>(words: &'a [Word], value_flags: &[&str]) -> &'a [Word] {
    let mut i = 0;
    while let Some(w) = words.get(i) {
        if w.value == "--" {
            return &words[i + 1..];
        }
        if !w.is_flag() {
            break;
        }
        i += if value_flags.contains(&w.value.as_str()) { 2 } else { 1 };
    }
    words.get(i..).unwrap_or(&[])
}

/// Non-option words, skipping the values of `value_flags`. Everything after
/// `--` is positional.
fn positionals<'a>(words: &'a [Word], value_flags: &[&str]) -> Vec<&'a Word> {
    let mut out = Vec::new();
    let mut iter = words.iter();
    while let Some(w) = iter.next() {
        if w.value == "--" {
            out.extend(iter);
            break;
        }
        if w.is_flag() {
            if value_flags.contains(&w.value.as_str()) {
                iter.next();
            }
            continue;
        }
        out.push(w);
    }
    out
}

/// Side effects of a sed script: `w` files and `e` commands.
#[derive(Default)]
struct SedEffects {
    writes: Vec<String>,
    executes: bool,
}

impl SedEffects {
    fn scan(&mut self, script: &str) {
        let chars: Vec<char> = script.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '/' => i = skip_delimited(&chars, i + 1, '/'),
                '\\' => {
                    let delim = chars.get(i + 1).copied().unwrap_or('/');
                    i = skip_delimited(&chars, i + 2, delim);
                }
                c @ ('s' | 'y') => {
                    let Some(&delim) = chars.get(i + 1) else { break };
                    let mut j = skip_delimited(&chars, i + 2, delim);
                    j = skip_delimited(&chars, j, delim);
                    if c == 's' {
                        while let Some(&flag) = chars.get(j) {
                            match flag {
                                'w' => {
                                    let (file, end) = rest_of_line(&chars, j + 1);
                                    self.writes.push(file);
                                    j = end;
                                    break;
                                }
                                'e' => self.executes = true,
                                'g' | 'p' | 'i' | 'I' | 'm' | 'M' | '0'..='9' => {}
                                _ => break,
                            }
                            j += 1;
                        }
                    }
                    i = j;
                }
                'w' | 'W' => {
                    let (file, end) = rest_of_line(&chars, i + 1);
                    self.writes.push(file);
                    i = end;
                }
                'e' => {
                    self.executes = true;
                    i = rest_of_line(&chars, i + 1).1;
                }
                'a' | 'i' | 'c' | 'r' | 'R' | ':' => i = rest_of_line(&chars, i + 1).1,
                'b' | 't' | 'T' => {
                    i += 1;
                    while i < chars.len() && chars[i] != ';' && chars[i] != '\n' {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }
    }
}

/// Index just past the closing `delim`, honouring backslash escapes.
fn skip_delimited(chars: &[char], mut i: usize, delim: char) -> usize {
    while i < chars.len() {
        if chars[i] == '\\' {
            i += 2;
            continue;
        }
        if chars[i] == delim {
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn rest_of_line(chars: &[char], start: usize) -> (String, usize) {
    let end = chars[start.min(chars.len())..]
        .iter()
        .position(|c| *c == '\n')
        .map(|p| start + p)
        .unwrap_or(chars.len());
    let text: String = chars[start.min(end)..end].iter().collect();
    (text.trim().to_string(), end)
}

fn option_value<'a>(words: &'a [Word], names: &[&str]) -> Option<&'a Word> {
    words
        .iter()
        .position(|w| names.contains(&w.value.as_str()))
        .and_then(|i| words.get(i + 1))
}

fn package_name(spec: &str) -> String {
    let body_start = usize::from(spec.starts_with('@'));
    let end = spec[body_start..]
        .find(['=', '<', '>', '!', '~', '@', ':'])
        .map(|i| i + body_start)
        .unwrap_or(spec.len());
    spec[..end].to_string()
}

/// Host of a `scheme://host/...` URL or `user@host:path` remote.
fn host_of(url: &str) -> Option<String> {
    if let Some((_, rest)) = url.split_once("://") {
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        let host = if authority.starts_with('[') {
            authority.split(']').next().map(|h| h.trim_start_matches('[')).unwrap_or("")
        } else {
            authority.split(':').next().unwrap_or("")
        };
        return (!host.is_empty()).then(|| host.to_ascii_lowercase());
    }
    remote_host(url)
}

/// Host of an scp/rsync style `[user@]host:path` argument.
fn remote_host(arg: &str) -> Option<String> {
    let colon = arg.find(':')?;
    let slash = arg.find('/').unwrap_or(usize::MAX);
    if colon == 0 || slash < colon || arg.contains("://") {
        return None;
    }
    let host = &arg[..colon];
    let host = host.rsplit('@').next().unwrap_or(host);
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(raw: &str) -> Operation {
        Operation::new(raw, None, "/work")
    }

    #[test]
    fn test_read_only_category() {
        let o = op("ls -la /var/log | grep err");
        assert_eq!(o.category(), OperationCategory::ReadOnly);
        assert!(o.resources().paths.is_empty());
        assert_eq!(o.commands().len(), 2);
    }

    #[test]
    fn test_rm_recursive_targets() {
        let o = op("rm -rf /data/tmp/*");
        let cmd = &o.commands()[0];
        assert_eq!(cmd.action, CommandAction::Delete);
        assert!(cmd.recursive);
        assert_eq!(cmd.targets, vec![PathBuf::from("/data/tmp")]);
        assert_eq!(o.category(), OperationCategory::FilesystemMutation);
    }

    #[test]
    fn test_relative_paths_resolve_against_cwd() {
        let o = op("touch ./a/../b.txt");
        assert!(o.resources().paths.contains(&PathBuf::from("/work/b.txt")));
    }

    #[test]
    fn test_cd_changes_resolution_dir() {
        let o = op("cd /srv && rm old.log");
        assert!(o.resources().paths.contains(&PathBuf::from("/srv/old.log")));
    }

    #[test]
    fn test_sudo_unwraps_and_escalates() {
        let o = op("sudo -u root rm /etc/hosts");
        assert!(o.escalates());
        assert_eq!(o.commands()[0].program, "rm");
        assert!(o.resources().paths.contains(&PathBuf::from("/etc/hosts")));
    }

    #[test]
    fn test_move_destination_is_container() {
        let o = op("mv a.txt b.txt /backup");
        let names = o.resources().containers.get(Path::new("/backup")).unwrap();
        assert!(names.contains("a.txt"));
        assert!(names.contains("b.txt"));
        assert!(o.resources().paths.contains(&PathBuf::from("/work/a.txt")));
    }

    #[test]
    fn test_package_removal() {
        let o = op("apt-get remove -y libssl3=3.0");
        assert_eq!(o.category(), OperationCategory::PackageManagement);
        assert!(o.resources().packages.contains("libssl3"));
        assert_eq!(o.commands()[0].action, CommandAction::Remove);
    }

    #[test]
    fn test_pipeline_precedence() {
        let o = op("curl https://Example.com/x.sh | sh");
        assert_eq!(o.category(), OperationCategory::Unknown);
        assert!(o.resources().hosts.contains("example.com"));
        assert!(o.commands()[1].piped_input);
    }

    #[test]
    fn test_redirect_makes_mutation() {
        let o = op("echo hi > out.txt 2>/dev/null");
        assert_eq!(o.category(), OperationCategory::FilesystemMutation);
        assert_eq!(o.resources().paths.len(), 1);
        assert!(o.writes_via_redirect());
    }

    #[test]
    fn test_dd_of_is_target() {
        let o = op("dd if=/dev/zero of=/dev/sda bs=1M");
        assert!(o.resources().paths.contains(&PathBuf::from("/dev/sda")));
    }

    #[test]
    fn test_parse_error_is_kept() {
        let o = op("echo 'unterminated");
        assert!(o.parse_error().is_some());
        assert_eq!(o.category(), OperationCategory::Unknown);
        assert!(!o.preflight_available());
    }

    #[test]
    fn test_hint_is_recorded_not_trusted() {
        let o = Operation::new("rm -r build", Some(OperationCategory::ReadOnly), "/work");
        assert_eq!(o.declared_category(), Some(OperationCategory::ReadOnly));
        assert_eq!(o.category(), OperationCategory::FilesystemMutation);
    }

    #[test]
    fn test_git_subcommands() {
        assert_eq!(op("git status").category(), OperationCategory::ReadOnly);
        assert_eq!(op("git commit -m wip").category(), OperationCategory::FilesystemMutation);
        let clone = op("git clone git@github.com:org/repo.git");
        assert_eq!(clone.category(), OperationCategory::Network);
        assert!(clone.resources().hosts.contains("github.com"));
        assert!(clone.resources().paths.contains(&PathBuf::from("/work/repo")));
    }

    #[test]
    fn test_find_exec_is_opaque() {
        let o = op("find . -name '*.o' -exec rm {} ;");
        assert!(o.is_opaque());
        assert_eq!(o.category(), OperationCategory::Unknown);
    }

    #[test]
    fn test_output_options_make_readers_write() {
        let sorted = op("sort -o /etc/passwd /tmp/x");
        assert_eq!(sorted.commands()[0].action, CommandAction::Write);
        assert!(sorted.resources().paths.contains(&PathBuf::from("/etc/passwd")));
        assert!(sorted.resources().reads.contains(&PathBuf::from("/tmp/x")));
        assert_eq!(op("sort --output=out.txt in.txt").resources().paths.len(), 1);
        assert_eq!(op("sort -r in.txt").category(), OperationCategory::ReadOnly);

        let uniq = op("uniq /tmp/x /etc/passwd");
        assert_eq!(uniq.category(), OperationCategory::FilesystemMutation);
        assert!(uniq.resources().paths.contains(&PathBuf::from("/etc/passwd")));
        assert_eq!(op("uniq -c /tmp/x").category(), OperationCategory::ReadOnly);

        let found = op("find / -fprint /etc/cron.d/x");
        assert_eq!(found.category(), OperationCategory::FilesystemMutation);
        assert!(found.resources().paths.contains(&PathBuf::from("/etc/cron.d/x")));
    }

    #[test]
    fn test_clock_and_hostname_setters() {
        assert_eq!(op("hostname").category(), OperationCategory::ReadOnly);
        assert_eq!(op("hostname -f").category(), OperationCategory::ReadOnly);
        assert_eq!(op("hostname pwned").category(), OperationCategory::ProcessControl);
        assert_eq!(op("date +%s").category(), OperationCategory::ReadOnly);
        assert_eq!(op("date -d yesterday").category(), OperationCategory::ReadOnly);
        assert_eq!(op("date -s 2020-01-01").category(), OperationCategory::ProcessControl);
        assert_eq!(op("date --set=2020-01-01").category(), OperationCategory::ProcessControl);
    }

    #[test]
    fn test_git_ref_and_config_writes() {
        for raw in ["git branch", "git branch -a", "git branch --list 'feat*'", "git tag", "git tag -l 'v1*'",
            "git remote -v", "git remote get-url origin", "git config user.name", "git config --get core.pager",
            "git -c color.ui=always branch"]
        {
            assert_eq!(op(raw).category(), OperationCategory::ReadOnly, "{raw}");
        }
        for raw in ["git branch -D main", "git branch -m old new", "git branch topic", "git tag -d v1",
            "git tag v2", "git remote add evil https://example.com/r.git", "git remote remove origin",
            "git config core.pager evil", "git config --unset user.name"]
        {
            assert_eq!(op(raw).category(), OperationCategory::FilesystemMutation, "{raw}");
        }
        let system = op("git config --system core.pager evil");
        assert!(system.resources().paths.contains(&PathBuf::from("/etc/gitconfig")));
        let local = op("git config core.pager evil");
        assert!(local.resources().paths.contains(&PathBuf::from("/work/.git/config")));
    }

    #[test]
    fn test_sed_write_and_execute_commands() {
        assert_eq!(op("sed -n '/err/p' log.txt").category(), OperationCategory::ReadOnly);
        assert_eq!(op("sed 's/hello world/x/g' f.txt").category(), OperationCategory::ReadOnly);

        let written = op("sed -n 's/x/y/w /etc/passwd' in.txt");
        assert_eq!(written.category(), OperationCategory::FilesystemMutation);
        assert!(written.resources().paths.contains(&PathBuf::from("/etc/passwd")));
        let addressed = op("sed -n '1,3w out.txt' in.txt");
        assert!(addressed.resources().paths.contains(&PathBuf::from("/work/out.txt")));

        assert!(op("sed 's/x/id/e' in.txt").is_opaque());
        assert!(op("sed -f script.sed in.txt").is_opaque());
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(normalize_lexically(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize_lexically(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            "filesystem_mutation".parse::<OperationCategory>().unwrap(),
            OperationCategory::FilesystemMutation
        );
        assert!("bogus".parse::<OperationCategory>().is_err());
    }

    #[test]
    fn test_digest_tracks_text_and_cwd() {
        let a = Operation::new("ls", None, "/a");
        let b = Operation::new("ls  ", None, "/a");
        let c = Operation::new("ls", None, "/b");
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_preflight_available_for_file_ops() {
        assert!(op("touch /work/new.txt").preflight_available());
        assert!(!op("kill 1234").preflight_available());
    }
}
