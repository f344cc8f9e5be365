use std::path::{Path, PathBuf};

/// Default root of the agent's per-project conversation logs.
///
/// Prefers `~/.claude/projects`; falls back to a relative path when no home
/// directory can be determined.
pub fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude").join("projects"))
}

/// Locate `<session>.jsonl` under the projects root.
///
/// Logs live one directory down, in a folder named after the project's
/// working directory. The root itself is checked too.
pub fn find_session_log(projects_dir: &Path, session: &str) -> Option<PathBuf> {
    if session.is_empty() || session.contains(['/', '\\']) || session.starts_with('.') {
        return None;
    }
    let file_name = format!("{session}.jsonl");

    let direct = projects_dir.join(&file_name);
    if direct.is_file() {
        return Some(direct);
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(projects_dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path().join(&file_name))
        .filter(|path| path.is_file())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_log_in_project_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("-home-dev-app");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("abc.jsonl"), "").unwrap();

        let found = find_session_log(tmp.path(), "abc").unwrap();
        assert_eq!(found, project.join("abc.jsonl"));
    }

    #[test]
    fn finds_log_at_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("abc.jsonl"), "").unwrap();
        assert_eq!(
            find_session_log(tmp.path(), "abc"),
            Some(tmp.path().join("abc.jsonl"))
        );
    }

    #[test]
    fn missing_log_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_session_log(tmp.path(), "abc").is_none());
        assert!(find_session_log(&tmp.path().join("nope"), "abc").is_none());
    }

    #[test]
    fn rejects_path_like_session_ids() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_session_log(tmp.path(), "../etc/passwd").is_none());
        assert!(find_session_log(tmp.path(), "").is_none());
    }

    #[test]
    fn default_projects_dir_ends_with_projects() {
        assert!(default_projects_dir().ends_with(".claude/projects"));
    }
}
