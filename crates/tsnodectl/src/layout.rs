//! Installation directory layout

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{CliError, CliResult};

pub const HOME_ENV: &str = "TSNODE_HOME";
const DEFAULT_DIR: &str = ".tsnode";

/// Where every persistent file of one installation lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `--home`, else `$TSNODE_HOME`, else `~/.tsnode`.
    pub fn resolve(flag: Option<PathBuf>) -> CliResult<Self> {
        Self::resolve_with(flag, std::env::var_os(HOME_ENV), dirs::home_dir())
    }

    fn resolve_with(
        flag: Option<PathBuf>,
        env: Option<OsString>,
        user_home: Option<PathBuf>,
    ) -> CliResult<Self> {
        if let Some(home) = flag {
            return Ok(Self::new(home));
        }
        if let Some(home) = env.filter(|v| !v.is_empty()) {
            return Ok(Self::new(home));
        }
        user_home
            .map(|h| Self::new(h.join(DEFAULT_DIR)))
            .ok_or(CliError::NoHome)
    }

    /// Create missing directories owner-only. Existing ones keep their mode.
    pub fn ensure(&self) -> CliResult<()> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        for dir in [self.home.clone(), self.keys_dir()] {
            builder.create(&dir)?;
        }
        Ok(())
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.home.join("keys")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.home.join("known_hosts")
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.home.join("credentials.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join("config.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins() {
        let layout = Layout::resolve_with(
            Some("/opt/tsnode".into()),
            Some("/env/tsnode".into()),
            Some("/home/op".into()),
        )
        .expect("resolve");
        assert_eq!(layout.home(), Path::new("/opt/tsnode"));
    }

    #[test]
    fn test_env_then_user_home() {
        let layout =
            Layout::resolve_with(None, Some("/env/tsnode".into()), Some("/home/op".into()))
                .expect("resolve");
        assert_eq!(layout.home(), Path::new("/env/tsnode"));

        let layout = Layout::resolve_with(None, Some(OsString::new()), Some("/home/op".into()))
            .expect("resolve");
        assert_eq!(layout.home(), Path::new("/home/op/.tsnode"));
        assert_eq!(layout.state_path(), Path::new("/home/op/.tsnode/state.json"));
    }

    #[test]
    fn test_no_home_is_an_error() {
        assert!(matches!(
            Layout::resolve_with(None, None, None),
            Err(CliError::NoHome)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_creates_private_dirs() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(dir.path().join("home"));
        layout.ensure().expect("ensure");
        let mode = std::fs::metadata(layout.keys_dir()).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_leaves_existing_home_mode_alone() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let home = dir.path().join("shared");
        std::fs::create_dir(&home).expect("mkdir");
        std::fs::set_permissions(&home, std::fs::Permissions::from_mode(0o750)).expect("chmod");

        let layout = Layout::new(&home);
        layout.ensure().expect("ensure");

        let mode = |p: &Path| std::fs::metadata(p).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode(&home), 0o750);
        assert_eq!(mode(&layout.keys_dir()), 0o700);
    }
}
