//! Shell-style variable expansion for inventory values
//!
//! `$(whoami)` and `$USER` become the local user name, `$HOME` and a leading
//! `~/` become the home directory. Anything else is left untouched.

use std::path::Path;

/// Expand with the current user and home directory
pub fn expand_shell_vars(value: &str) -> String {
    let home = dirs::home_dir();
    expand_with(value, &whoami::username(), home.as_deref())
}

/// Expand against explicit values
pub fn expand_with(value: &str, user: &str, home: Option<&Path>) -> String {
    if value.is_empty() {
        return String::new();
    }

    let mut value = value.replace("$(whoami)", user).replace("$USER", user);

    if let Some(home) = home {
        let home = home.to_string_lossy();
        value = value.replace("$HOME", &home);
        if let Some(rest) = value.strip_prefix("~/") {
            value = format!("{}/{}", home.trim_end_matches('/'), rest);
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_variables() {
        assert_eq!(expand_with("$(whoami)", "alice", None), "alice");
        assert_eq!(expand_with("$USER-admin", "alice", None), "alice-admin");
    }

    #[test]
    fn test_home_variables() {
        let home = Path::new("/home/alice");
        assert_eq!(
            expand_with("~/.ssh/id_ed25519", "alice", Some(home)),
            "/home/alice/.ssh/id_ed25519"
        );
        assert_eq!(
            expand_with("$HOME/keys/$USER", "alice", Some(home)),
            "/home/alice/keys/alice"
        );
        // Only a leading tilde is expanded
        assert_eq!(expand_with("/tmp/~/x", "alice", Some(home)), "/tmp/~/x");
    }

    #[test]
    fn test_plain_values_untouched() {
        assert_eq!(expand_with("deploy", "alice", None), "deploy");
        assert_eq!(expand_with("", "alice", None), "");
        assert_eq!(expand_with("~/key", "alice", None), "~/key");
    }
}
