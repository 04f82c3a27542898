use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "coffer";
pub const APP_NAME: &str = "coffer";

pub fn data_dir() -> crate::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("COFFER_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine data directory",
        )
    })?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn records_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("records")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}
