//! Command builders for sandboxed tools.
//!
//! Sandboxed tools never run in the service process; these helpers turn tool
//! arguments into the argv the sandbox driver execs inside the container.

/// Single-quote a string for `sh -c`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// argv for the `run_shell` tool.
pub fn shell_argv(command: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), command.to_string()]
}

/// argv for the `run_python` tool.
pub fn python_argv(code: &str) -> Vec<String> {
    vec!["python3".into(), "-c".into(), code.to_string()]
}

/// argv for the `write_file` tool: create parent dirs, then write via stdin
/// redirection so arbitrary content survives quoting.
pub fn write_file_argv(path: &str, content: &str) -> Vec<String> {
    let quoted_path = shell_quote(path);
    let script = format!(
        "mkdir -p \"$(dirname {quoted_path})\" && printf '%s' {} > {quoted_path}",
        shell_quote(content)
    );
    vec!["sh".into(), "-c".into(), script]
}

/// Packages named by a `pip install` (or `pip3 install`) invocation, for
/// sandbox history tracking. Flags and requirement files are skipped.
pub fn pip_installed_packages(command: &str) -> Vec<String> {
    let mut packages = Vec::new();
    for segment in command.split("&&") {
        let words: Vec<&str> = segment.split_whitespace().collect();
        let install_pos = words.windows(2).position(|w| {
            (w[0] == "pip" || w[0] == "pip3" || w[0].ends_with("/pip") || w[0].ends_with("/pip3"))
                && w[1] == "install"
        });
        let Some(pos) = install_pos else { continue };
        let mut skip_next = false;
        for word in &words[pos + 2..] {
            if skip_next {
                skip_next = false;
                continue;
            }
            if *word == "-r" || *word == "--requirement" {
                skip_next = true;
                continue;
            }
            if word.starts_with('-') {
                continue;
            }
            packages.push(word.to_string());
        }
    }
    packages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn shell_and_python_argv_shapes() {
        assert_eq!(shell_argv("ls -la"), vec!["sh", "-c", "ls -la"]);
        assert_eq!(
            python_argv("print(1)"),
            vec!["python3", "-c", "print(1)"]
        );
    }

    #[test]
    fn write_file_argv_creates_parents() {
        let argv = write_file_argv("out/data.csv", "a,b\n1,2");
        assert_eq!(argv[0], "sh");
        assert!(argv[2].contains("mkdir -p"));
        assert!(argv[2].contains("'out/data.csv'"));
    }

    #[test]
    fn pip_extraction() {
        assert_eq!(
            pip_installed_packages("pip install requests numpy"),
            vec!["requests", "numpy"]
        );
        assert_eq!(
            pip_installed_packages("apt update && pip3 install --quiet pandas"),
            vec!["pandas"]
        );
        assert!(pip_installed_packages("pip install -r requirements.txt").is_empty());
        assert!(pip_installed_packages("ls -la").is_empty());
    }
}
