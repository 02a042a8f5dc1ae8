use std::{fs::DirBuilder, path::PathBuf};

const APP_DIR: &str = "varsync";

/// Shorthand for `Err(format!(...))`.
#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => {
        Err(format!($($arg)*))
    };
}

fn affirm_dir(mut path: PathBuf, what: &str) -> Result<PathBuf, String> {
    path.push(APP_DIR);
    if !path.exists() && DirBuilder::new().recursive(true).create(&path).is_err() {
        err!("Failed to create varsync {what} directory!")
    } else {
        Ok(path)
    }
}

pub fn get_dir() -> Result<PathBuf, String> {
    match dirs::config_dir() {
        Some(path) => affirm_dir(path, "config"),
        None => err!("Cannot locate the user configuration directory!"),
    }
}

pub fn get_cache_dir() -> Result<PathBuf, String> {
    match dirs::cache_dir() {
        Some(path) => affirm_dir(path, "cache"),
        None => err!("Cannot locate the user cache directory!"),
    }
}

pub fn get_log_dir() -> Result<PathBuf, String> {
    let mut path = get_cache_dir()?;
    path.push("logs");
    if !path.exists() && DirBuilder::new().recursive(true).create(&path).is_err() {
        err!("Failed to create varsync log directory!")
    } else {
        Ok(path)
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_err_macro() {
        let result: Result<(), String> = err!("missing {}", "thing");
        assert_eq!(result, Err(String::from("missing thing")));
    }
}
