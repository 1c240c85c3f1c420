//! Shell quoting for commands that cross a transport as a single string

use std::collections::BTreeMap;
use std::path::Path;

/// Escape a string for safe inclusion in a POSIX shell command
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.contains(|c: char| c.is_whitespace() || "\"'\\$`!*?<>|&;()[]{}#~=%".contains(c)) {
        // Use single quotes and escape any single quotes in the string
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    } else {
        s.to_string()
    }
}

/// Join a program and its arguments into one escaped command line
pub fn join_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut line = shell_escape(program);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape(arg.as_ref()));
    }
    line
}

/// Prefix a command line with a directory change and exported variables
///
/// Used where the transport has no native way to set the working directory
/// or environment of the remote process.
pub fn with_context(line: &str, cwd: Option<&Path>, env: &BTreeMap<String, String>) -> String {
    let mut script = String::new();

    if let Some(dir) = cwd {
        script.push_str(&format!("cd {} && ", shell_escape(&dir.to_string_lossy())));
    }

    if !env.is_empty() {
        let assignments: Vec<String> = env
            .iter()
            .map(|(key, value)| format!("{}={}", key, shell_escape(value)))
            .collect();
        script.push_str(&format!("export {} && ", assignments.join(" ")));
    }

    script.push_str(line);
    script
}

/// Quote a path for an sftp batch file
pub fn sftp_quote(path: &str) -> String {
    format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
}
