//! Command implementations
//!
//! Each command writes its user-facing output to `out` so it can be tested
//! against any backend.

use anyhow::{anyhow, bail, Context, Result};
use chrono::FixedOffset;
use dotfile_core::staging::{self, StagingSource};
use dotfile_core::views::format_time;
use dotfile_core::{
    migrate, scoped, Backend, EngineError, Fingerprint, SqliteBackend, TrackingData, WorkingFile,
};
use std::io::Write;
use std::path::Path;

/// Everything a command needs besides its arguments
pub struct App {
    pub backend: Box<dyn Backend>,
    pub owner: String,
    pub offset: FixedOffset,
}

/// Alias derived from a path: the file name without leading dots
pub fn default_alias(path: &str) -> Result<String> {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().trim_start_matches('.').to_string())
        .unwrap_or_default();
    if name.is_empty() {
        bail!("Cannot derive an alias from {:?}, pass one explicitly", path);
    }
    Ok(name)
}

/// Print a history newest first, marking the current revision with `*`
pub fn write_log(data: &TrackingData, offset: &FixedOffset, out: &mut dyn Write) -> Result<()> {
    for commit in &data.commits {
        let marker = if commit.hash == data.revision { "*" } else { " " };
        writeln!(
            out,
            "{} {}  {}  {}",
            marker,
            commit.hash,
            format_time(commit.timestamp, offset),
            commit.message
        )?;
    }
    Ok(())
}

pub fn write_tracking(data: &TrackingData, out: &mut dyn Write) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(data)?)?;
    Ok(())
}

impl App {
    pub fn init(&self, path: &str, alias: Option<&str>, out: &mut dyn Write) -> Result<()> {
        let alias = match alias {
            Some(alias) => alias.to_string(),
            None => default_alias(path)?,
        };
        let mut source = WorkingFile::new(path)?;
        let handle = self.backend.track(&self.owner, &alias)?;
        let summary = scoped(handle, |file| staging::init_from(file, &mut source))
            .with_context(|| format!("Failed to start tracking {}", path))?;
        writeln!(out, "Tracking {} as {} ({})", path, alias, summary.hash)?;
        Ok(())
    }

    pub fn commit(&self, alias: &str, message: &str, out: &mut dyn Write) -> Result<()> {
        let handle = self.backend.track(&self.owner, alias)?;
        let result = scoped(handle, |file| {
            let mut source = WorkingFile::new(&file.path()?)?;
            staging::commit_from(file, &mut source, message)
        });
        match result {
            Ok(summary) => writeln!(out, "Committed {} ({})", alias, summary.hash)?,
            Err(EngineError::NoChanges(_)) => writeln!(out, "Nothing to commit for {}", alias)?,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub fn checkout(&self, alias: &str, hash: &str, out: &mut dyn Write) -> Result<()> {
        let fingerprint: Fingerprint = hash
            .parse()
            .map_err(|e| anyhow!("Invalid revision {:?}: {}", hash, e))?;
        let handle = self.backend.open(&self.owner, alias)?;
        let path = scoped(handle, |file| {
            let mut source = WorkingFile::new(&file.path()?)?;
            staging::checkout_into(file, &mut source, &fingerprint)?;
            Ok(source.path().to_string())
        })?;
        writeln!(out, "Checked out {} to {}", fingerprint, path)?;
        Ok(())
    }

    pub fn log(&self, alias: &str, out: &mut dyn Write) -> Result<()> {
        let handle = self.backend.open(&self.owner, alias)?;
        let data = scoped(handle, |file| file.tracking_data())?;
        write_log(&data, &self.offset, out)
    }

    pub fn show(&self, alias: &str, data: bool, out: &mut dyn Write) -> Result<()> {
        let handle = self.backend.open(&self.owner, alias)?;
        if data {
            let tracking = scoped(handle, |file| file.tracking_data())?;
            write_tracking(&tracking, out)?;
        } else {
            let content = scoped(handle, |file| file.current_content())?;
            out.write_all(&content)?;
        }
        Ok(())
    }

    pub fn list(&self, out: &mut dyn Write) -> Result<()> {
        for summary in self.backend.summaries(&self.owner, &self.offset)? {
            writeln!(
                out,
                "{:<16} {:<40} {:>3} commits  {}",
                summary.alias, summary.path, summary.num_commits, summary.updated_at
            )?;
        }
        Ok(())
    }

    pub fn forget(&self, alias: &str, out: &mut dyn Write) -> Result<()> {
        self.backend.remove(&self.owner, alias)?;
        writeln!(out, "Stopped tracking {}", alias)?;
        Ok(())
    }

    pub fn status(&self, alias: &str, out: &mut dyn Write) -> Result<()> {
        let handle = self.backend.open(&self.owner, alias)?;
        let (path, changed) = scoped(handle, |file| {
            let source = WorkingFile::new(&file.path()?)?;
            Ok((source.path().to_string(), staging::has_changes(file, &source)?))
        })?;
        let state = if changed { "modified" } else { "clean" };
        writeln!(out, "{} ({}): {}", alias, path, state)?;
        Ok(())
    }

    /// Replay a file's history into a hosted database
    pub fn migrate(
        &self,
        alias: &str,
        database: &Path,
        owner: &str,
        out: &mut dyn Write,
    ) -> Result<()> {
        let hosted = SqliteBackend::open(database)
            .with_context(|| format!("Failed to open database {:?}", database))?;
        if !hosted.owner_exists(owner)? {
            hosted.register_owner(owner)?;
        }
        let src = self.backend.open(&self.owner, alias)?;
        let dst = match hosted.track(owner, alias) {
            Ok(dst) => dst,
            Err(e) => {
                scoped(src, |_| Ok(()))?;
                return Err(e.into());
            }
        };
        let current = scoped(src, |src| scoped(dst, |dst| migrate::replay(&*src, dst)))?;
        writeln!(out, "Migrated {} to {}/{} at {}", alias, owner, alias, current.hash)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotfile_core::LocalBackend;
    use std::fs;
    use tempfile::TempDir;

    const CONTENT: &str = "Testing content. Stored as a blob.";
    const UPDATED: &str = "Testing content. Stored as a blob.\n New content!\n";

    struct Fixture {
        tmp: TempDir,
        app: App,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let backend = LocalBackend::open(&tmp.path().join("store")).unwrap();
            let app = App {
                backend: Box::new(backend),
                owner: "local".into(),
                offset: FixedOffset::east_opt(0).unwrap(),
            };
            Self { tmp, app }
        }

        fn tracked_file(&self) -> String {
            let path = self.tmp.path().join("dotfile").join("test-file.txt");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, CONTENT).unwrap();
            let path = path.to_str().unwrap().to_string();
            self.app.init(&path, Some("testalias"), &mut Vec::new()).unwrap();
            path
        }
    }

    fn output(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_default_alias() {
        assert_eq!(default_alias("~/.bashrc").unwrap(), "bashrc");
        assert_eq!(default_alias("~/.config/nvim/init.lua").unwrap(), "init.lua");
        assert!(default_alias("~/..").is_err());
    }

    #[test]
    fn test_commit() {
        let fx = Fixture::new();
        let path = fx.tracked_file();

        // returns error when file is not tracked
        assert!(fx.app.commit("nottracked", "test commit", &mut Vec::new()).is_err());

        // ok
        fs::write(&path, UPDATED).unwrap();
        let text = output(|out| fx.app.commit("testalias", "test commit", out));
        assert!(text.starts_with("Committed testalias"));

        let text = output(|out| fx.app.commit("testalias", "test commit", out));
        assert_eq!(text, "Nothing to commit for testalias\n");
    }

    #[test]
    fn test_checkout_restores_working_file() {
        let fx = Fixture::new();
        let path = fx.tracked_file();
        fs::write(&path, UPDATED).unwrap();
        fx.app.commit("testalias", "test commit", &mut Vec::new()).unwrap();

        let hash = Fingerprint::of(CONTENT.as_bytes()).to_hex();
        fx.app.checkout("testalias", &hash, &mut Vec::new()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), CONTENT);

        let log = output(|out| fx.app.log("testalias", out));
        let lines: Vec<_> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("  "));
        assert!(lines[1].starts_with(&format!("* {}", hash)));

        assert!(fx.app.checkout("testalias", "zz", &mut Vec::new()).is_err());
    }

    #[test]
    fn test_status_and_show() {
        let fx = Fixture::new();
        let path = fx.tracked_file();
        let status = output(|out| fx.app.status("testalias", out));
        assert!(status.ends_with("clean\n"));

        fs::write(&path, UPDATED).unwrap();
        let status = output(|out| fx.app.status("testalias", out));
        assert!(status.ends_with("modified\n"));

        assert_eq!(output(|out| fx.app.show("testalias", false, out)), CONTENT);
        let data: serde_json::Value =
            serde_json::from_str(&output(|out| fx.app.show("testalias", true, out))).unwrap();
        assert_eq!(data["revision"], Fingerprint::of(CONTENT.as_bytes()).to_hex());
        assert_eq!(data["commits"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_list_and_forget() {
        let fx = Fixture::new();
        fx.tracked_file();
        let listing = output(|out| fx.app.list(out));
        assert!(listing.starts_with("testalias"));
        assert!(listing.contains("1 commits"));

        fx.app.forget("testalias", &mut Vec::new()).unwrap();
        assert!(output(|out| fx.app.list(out)).is_empty());
        assert!(fx.app.forget("testalias", &mut Vec::new()).is_err());
    }

    #[test]
    fn test_migrate_to_database() {
        let fx = Fixture::new();
        let path = fx.tracked_file();
        fs::write(&path, UPDATED).unwrap();
        fx.app.commit("testalias", "test commit", &mut Vec::new()).unwrap();

        let database = fx.tmp.path().join("dotfilehub.db");
        fx.app
            .migrate("testalias", &database, "genericusername", &mut Vec::new())
            .unwrap();

        let hosted = SqliteBackend::open(&database).unwrap();
        let file = hosted.open("genericusername", "testalias").unwrap();
        assert_eq!(file.history().unwrap().len(), 2);
        assert_eq!(file.current_content().unwrap(), UPDATED.as_bytes());
    }

    #[test]
    fn test_failed_migrate_leaves_both_sides_usable() {
        let fx = Fixture::new();
        fx.tracked_file();
        let database = fx.tmp.path().join("dotfilehub.db");
        fx.app
            .migrate("testalias", &database, "genericusername", &mut Vec::new())
            .unwrap();

        let err = fx
            .app
            .migrate("testalias", &database, "genericusername", &mut Vec::new())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::AlreadyTracked(_))
        ));

        // Neither handle was left holding a lock or an open transaction
        fs::write(fx.tmp.path().join("dotfile").join("test-file.txt"), UPDATED).unwrap();
        fx.app.commit("testalias", "after migrate", &mut Vec::new()).unwrap();
        let hosted = SqliteBackend::open(&database).unwrap();
        let handle = hosted.track("genericusername", "testalias").unwrap();
        scoped(handle, |file| file.commit(UPDATED.as_bytes(), "hosted edit")).unwrap();
        let file = hosted.open("genericusername", "testalias").unwrap();
        assert_eq!(file.history().unwrap().len(), 2);
    }
}
