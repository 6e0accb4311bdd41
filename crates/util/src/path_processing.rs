use std::path::PathBuf;

use dirs_next::home_dir;

/// Expand a leading `~` into the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let trimmed = path.trim();
    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("  /etc/stepwise/engine.json "), PathBuf::from("/etc/stepwise/engine.json"));
    }

    #[cfg(unix)]
    #[test]
    fn expands_home_prefix() {
        temp_env::with_var("HOME", Some("/home/tester"), || {
            assert_eq!(expand_tilde("~/stepwise/engine.json"), PathBuf::from("/home/tester/stepwise/engine.json"));
            assert_eq!(expand_tilde("~"), PathBuf::from("/home/tester"));
        });
    }
}
