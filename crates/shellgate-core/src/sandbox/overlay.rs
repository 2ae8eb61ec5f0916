//! Disposable copy of the resource surface used by Simulation.
//!
//! The touched paths are mirrored under a temporary root and path words in
//! the command are rewritten to point into it. Mirrored symlinks are
//! re-targeted into the root as well. The root is removed when the overlay
//! is dropped.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use super::error::{SandboxError, SandboxResult};
use crate::domain::lexer::{self, Word};
use crate::domain::operation::{is_pseudo_device, normalize_lexically};
use crate::domain::Operation;
use crate::tracker::resource::physical_path;
use crate::tracker::ResourceSet;

#[derive(Debug)]
pub struct Overlay {
    dir: TempDir,
    root: PathBuf,
    home: PathBuf,
}

impl Overlay {
    /// Mirror `set` and the operation's read paths into a fresh root.
    pub fn prepare(op: &Operation, set: &ResourceSet, max_entries: usize) -> SandboxResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("shellgate-ovl-")
            .tempdir()
            .map_err(|e| SandboxError::Overlay(format!("create overlay dir: {e}")))?;
        let root = dir.path().join("root");
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let overlay = Self { dir, root, home };

        std::fs::create_dir_all(&overlay.root)?;
        std::fs::create_dir_all(overlay.physical(op.cwd()))?;
        std::fs::create_dir_all(overlay.physical(&overlay.home))?;

        let mut copied = 0usize;
        let mut link_targets = VecDeque::new();
        for logical in set.paths.iter().chain(op.resources().reads.iter()) {
            let (count, links) = overlay.mirror(logical, max_entries.saturating_sub(copied))?;
            copied += count;
            link_targets.extend(links);
        }
        let mut seen = BTreeSet::new();
        while let Some(logical) = link_targets.pop_front() {
            if !seen.insert(logical.clone()) || std::fs::symlink_metadata(overlay.physical(&logical)).is_ok() {
                continue;
            }
            let (count, links) = overlay.mirror(&logical, max_entries.saturating_sub(copied))?;
            copied += count;
            link_targets.extend(links);
        }
        debug!(root = %overlay.root.display(), entries = copied, "overlay prepared");
        Ok(overlay)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn physical(&self, logical: &Path) -> PathBuf {
        physical_path(Some(&self.root), logical)
    }

    /// Environment overrides for the child.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(
            "HOME".to_string(),
            self.physical(&self.home).to_string_lossy().into_owned(),
        )]
    }

    /// Rewrite path words so they resolve inside the overlay. Program names
    /// are left alone.
    ///
    /// Relative words that climb with `..` are resolved against the tracked
    /// working directory and pinned to their absolute overlay path. Words the
    /// overlay cannot confine are refused.
    pub fn rewrite(&self, op: &Operation) -> SandboxResult<String> {
        let mut cwd = Some(op.cwd().to_path_buf());
        let mut segments = Vec::with_capacity(op.segments().len());
        for segment in op.segments() {
            let mut segment = segment.clone();
            for word in segment.words.iter_mut().skip(1) {
                self.rewrite_word(word, cwd.as_deref())?;
            }
            for redirect in &mut segment.redirects {
                self.rewrite_word(&mut redirect.target, cwd.as_deref())?;
            }
            if segment.words.first().is_some_and(|w| w.value == "cd") {
                cwd = self.cd_target(&segment.words[1..], cwd.as_deref());
            }
            segments.push(segment);
        }
        Ok(lexer::render(&segments))
    }

    fn rewrite_word(&self, word: &mut Word, cwd: Option<&Path>) -> SandboxResult<()> {
        if word.expansion || word.substitution {
            return Err(refuse(word));
        }
        if word.value.starts_with('/') {
            if !is_pseudo_device(Path::new(&word.value)) {
                word.raw = format!("{}{}", lexer::quote(&self.root.to_string_lossy()), word.raw);
            }
            return Ok(());
        }
        if word.tilde && (word.raw == "~" || word.raw.starts_with("~/")) {
            let home = self.physical(&self.home);
            word.raw = format!("{}{}", lexer::quote(&home.to_string_lossy()), &word.raw[1..]);
            return Ok(());
        }
        // dd of=/dev/x, --output=../out
        if let Some((key, rest)) = word.raw.split_once('=') {
            let plain_key = !key.is_empty()
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            let plain_rest = rest.chars().all(|c| !"'\"\\*?[".contains(c));
            if plain_key && plain_rest {
                if rest.starts_with('/') {
                    if !is_pseudo_device(Path::new(rest)) {
                        word.raw = format!("{key}={}{rest}", lexer::quote(&self.root.to_string_lossy()));
                    }
                    return Ok(());
                }
                if climbs(rest) {
                    let cwd = cwd.ok_or_else(|| refuse(word))?;
                    let physical = self.physical(&normalize_lexically(&cwd.join(rest)));
                    word.raw = format!("{key}={}", lexer::quote(&physical.to_string_lossy()));
                    return Ok(());
                }
            }
        }
        if climbs(&word.value) {
            if word.glob {
                return Err(refuse(word));
            }
            let cwd = cwd.ok_or_else(|| refuse(word))?;
            let physical = self.physical(&normalize_lexically(&cwd.join(&word.value)));
            word.raw = lexer::quote(&physical.to_string_lossy());
        }
        Ok(())
    }

    /// Logical directory a `cd` moves to, `None` when it cannot be known.
    fn cd_target(&self, args: &[Word], cwd: Option<&Path>) -> Option<PathBuf> {
        let Some(arg) = args.iter().find(|w| !w.is_flag()) else {
            return Some(self.home.clone());
        };
        if arg.value == "-" || arg.expansion || arg.substitution || arg.glob {
            return None;
        }
        if arg.tilde && (arg.value == "~" || arg.value.starts_with("~/")) {
            let rest = arg.value.trim_start_matches('~').trim_start_matches('/');
            return Some(normalize_lexically(&self.home.join(rest)));
        }
        Some(normalize_lexically(&cwd?.join(&arg.value)))
    }

    /// Copy one logical path (and its parent chain) into the overlay.
    ///
    /// Returns the entry count and the logical targets of mirrored symlinks.
    fn mirror(&self, logical: &Path, budget: usize) -> SandboxResult<(usize, Vec<PathBuf>)> {
        let target = self.physical(logical);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::symlink_metadata(logical) {
            Err(_) => return Ok((0, Vec::new())),
            Ok(meta) if meta.file_type().is_symlink() => {
                if budget == 0 {
                    return Err(SandboxError::SurfaceTooLarge { limit: budget });
                }
                return Ok((1, vec![self.copy_link(logical, &target)?]));
            }
            Ok(_) => {}
        }

        let own_dir = self.dir.path().to_path_buf();
        let mut count = 0usize;
        let mut links = Vec::new();
        let walker = WalkDir::new(logical)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !e.path().starts_with(&own_dir));
        for entry in walker {
            let entry = entry.map_err(|e| SandboxError::Snapshot {
                path: logical.display().to_string(),
                reason: e.to_string(),
            })?;
            count += 1;
            if count > budget {
                return Err(SandboxError::SurfaceTooLarge { limit: budget });
            }
            let rel = entry.path().strip_prefix(logical).unwrap_or(Path::new(""));
            let dest = if rel.as_os_str().is_empty() {
                target.clone()
            } else {
                target.join(rel)
            };
            if entry.file_type().is_symlink() {
                links.push(self.copy_link(entry.path(), &dest)?);
            } else {
                copy_entry(entry.path(), &dest, entry.file_type())?;
            }
        }
        Ok((count, links))
    }

    /// Recreate a symlink pointing at the overlay copy of its target.
    fn copy_link(&self, src: &Path, dest: &Path) -> SandboxResult<PathBuf> {
        let link = std::fs::read_link(src)?;
        let base = src.parent().unwrap_or(Path::new("/"));
        let logical = normalize_lexically(&base.join(&link));
        let physical = self.physical(&logical);
        #[cfg(unix)]
        {
            match std::os::unix::fs::symlink(&physical, dest) {
                Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => return Err(e.into()),
                _ => {}
            }
        }
        #[cfg(not(unix))]
        let _ = (&physical, dest);
        Ok(logical)
    }

    /// Remove the overlay now, reporting errors instead of ignoring them.
    pub fn discard(self) -> SandboxResult<()> {
        self.dir
            .close()
            .map_err(|e| SandboxError::Overlay(format!("discard overlay: {e}")))
    }
}

fn copy_entry(src: &Path, dest: &Path, file_type: std::fs::FileType) -> SandboxResult<()> {
    if file_type.is_dir() {
        std::fs::create_dir_all(dest)?;
        let perms = std::fs::metadata(src)?.permissions();
        std::fs::set_permissions(dest, perms)?;
    } else if file_type.is_file() {
        std::fs::copy(src, dest)?;
    }
    Ok(())
}

fn climbs(value: &str) -> bool {
    Path::new(value).components().any(|c| c == Component::ParentDir)
}

fn refuse(word: &Word) -> SandboxError {
    SandboxError::Overlay(format!("cannot confine `{}` to the overlay", word.raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_absolute_paths() {
        let real = tempfile::tempdir().unwrap();
        std::fs::write(real.path().join("a.txt"), b"x").unwrap();
        let op = Operation::new(
            format!("rm {}/a.txt > /tmp/log.txt", real.path().display()),
            None,
            real.path(),
        );
        let set = ResourceSet::scoped(&op, None);
        let ovl = Overlay::prepare(&op, &set, 100).unwrap();
        let script = ovl.rewrite(&op).unwrap();
        let root = ovl.root().display().to_string();
        assert!(script.starts_with("rm "));
        assert!(script.contains(&format!("{root}{}/a.txt", real.path().display())));
        assert!(script.contains(&format!("{root}/tmp/log.txt")));
    }

    #[test]
    fn test_program_word_untouched_and_dd_operand_rewritten() {
        let op = Operation::new("/bin/dd if=/dev/zero of=/srv/img bs=1M count=1 2>/dev/null", None, "/");
        let ovl = Overlay::prepare(&op, &ResourceSet::default(), 100).unwrap();
        let script = ovl.rewrite(&op).unwrap();
        let root = ovl.root().display().to_string();
        assert!(script.starts_with("/bin/dd "));
        assert!(script.contains("if=/dev/zero"));
        assert!(script.contains(&format!("of={root}/srv/img")));
        assert!(script.ends_with("2> /dev/null"));
    }

    #[test]
    fn test_mirror_copies_content_and_leaves_real_files() {
        let real = tempfile::tempdir().unwrap();
        std::fs::create_dir(real.path().join("data")).unwrap();
        std::fs::write(real.path().join("data/f.txt"), b"hello").unwrap();

        let op = Operation::new("rm -r data", None, real.path());
        let set = ResourceSet::scoped(&op, None);
        let ovl = Overlay::prepare(&op, &set, 100).unwrap();
        let copy = ovl.physical(&real.path().join("data/f.txt"));
        assert_eq!(std::fs::read(&copy).unwrap(), b"hello");

        std::fs::remove_dir_all(ovl.physical(&real.path().join("data"))).unwrap();
        assert!(real.path().join("data/f.txt").exists());

        let root = ovl.root().to_path_buf();
        ovl.discard().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_climbing_relative_words_are_pinned_inside_root() {
        let real = tempfile::tempdir().unwrap();
        let ups = "../".repeat(real.path().components().count() + 3);
        let op = Operation::new(format!("touch {ups}srv/escaped.txt > ../log.txt"), None, real.path());
        let ovl = Overlay::prepare(&op, &ResourceSet::scoped(&op, None), 100).unwrap();
        let script = ovl.rewrite(&op).unwrap();
        let root = ovl.root().display().to_string();
        assert!(!script.contains(".."), "{script}");
        assert!(script.contains(&format!("{root}/srv/escaped.txt")));
        let parent = real.path().parent().unwrap().display().to_string();
        assert!(script.contains(&format!("{root}{parent}/log.txt")));
    }

    #[test]
    fn test_cd_is_tracked_for_later_words() {
        let op = Operation::new("cd /srv/app && rm ../old.txt", None, "/");
        let ovl = Overlay::prepare(&op, &ResourceSet::default(), 100).unwrap();
        let script = ovl.rewrite(&op).unwrap();
        let root = ovl.root().display().to_string();
        assert!(script.contains(&format!("cd {root}/srv/app")));
        assert!(script.contains(&format!("rm {root}/srv/old.txt")));
    }

    #[test]
    fn test_unconfinable_words_are_refused() {
        for raw in ["rm ../*.log", "touch $TARGET", "cd - && touch ../x"] {
            let op = Operation::new(raw, None, "/srv");
            let ovl = Overlay::prepare(&op, &ResourceSet::default(), 100).unwrap();
            assert!(matches!(ovl.rewrite(&op), Err(SandboxError::Overlay(_))), "{raw}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_mirrored_symlinks_point_into_root() {
        let real = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, b"original\n").unwrap();
        std::fs::create_dir(real.path().join("data")).unwrap();
        std::os::unix::fs::symlink(&victim, real.path().join("data/abs")).unwrap();
        std::os::unix::fs::symlink("../../escape", real.path().join("data/rel")).unwrap();

        let op = Operation::new("rm -r data", None, real.path());
        let ovl = Overlay::prepare(&op, &ResourceSet::scoped(&op, None), 100).unwrap();

        let abs = std::fs::read_link(ovl.physical(&real.path().join("data/abs"))).unwrap();
        assert_eq!(abs, ovl.physical(&victim));
        let rel = std::fs::read_link(ovl.physical(&real.path().join("data/rel"))).unwrap();
        assert!(rel.starts_with(ovl.root()));

        // The link target was pulled into the overlay, so writes land on the copy.
        std::fs::write(ovl.physical(&real.path().join("data/abs")), b"changed").unwrap();
        assert_eq!(std::fs::read(&victim).unwrap(), b"original\n");
        assert_eq!(std::fs::read(ovl.physical(&victim)).unwrap(), b"changed");
    }

    #[test]
    fn test_mirror_respects_budget() {
        let real = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(real.path().join(format!("f{i}")), b"x").unwrap();
        }
        let op = Operation::new(format!("rm -r {}", real.path().display()), None, "/");
        let set = ResourceSet::scoped(&op, None);
        let err = Overlay::prepare(&op, &set, 3).unwrap_err();
        assert!(matches!(err, SandboxError::SurfaceTooLarge { .. }));
    }
}
