//! Build script generation
//!
//! A job's declarative instructions are compiled into a bash script that
//! encodes the phase state machine:
//!
//! | Phase | On failure |
//! |---|---|
//! | source staging, `install` | `after_error`, `after_script`, exit 11 |
//! | `test`, `before_script`, `script` | `after_failure`, `after_script`, exit 12 |
//!
//! When every phase succeeds the script runs `after_success` and
//! `after_script` and exits 0. Absent phases succeed without output. Each
//! command runs in a subshell, so `exit` inside a command only ends that
//! step.

use buildq_common::{Job, Phase, QueueName, EXIT_ERROR, EXIT_FAILURE, EXIT_SUCCESS};
use std::borrow::Cow;
use std::fmt::Write as _;
use tracing::warn;

use crate::log_sink::SECTION_MARKER;

/// File name of the generated script inside the working directory
pub const SCRIPT_NAME: &str = "build_script.sh";

/// File name of a downloaded source tarball inside the working directory
pub const SOURCE_TARBALL: &str = "build_source.tar";

/// Directory the staged source is unpacked or cloned into
pub const SOURCE_DIR: &str = "source";

/// How the script obtains the source tree before `install`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStaging {
    /// Build in the working directory as-is
    None,
    /// Unpack [`SOURCE_TARBALL`] from the working directory
    Tarball,
    /// Clone a repository
    Git { url: String, branch: Option<String> },
}

impl SourceStaging {
    /// Staging for a job when no tarball was downloaded
    pub fn for_job(job: &Job) -> Self {
        match &job.git_url {
            Some(url) if !url.trim().is_empty() => SourceStaging::Git {
                url: url.clone(),
                branch: job.git_branch.clone().filter(|b| !b.trim().is_empty()),
            },
            _ => SourceStaging::None,
        }
    }
}

/// Worker-side inputs to script generation
#[derive(Debug, Clone)]
pub struct ScriptContext<'a> {
    pub queue: &'a QueueName,
    pub worker_id: &'a str,
    pub source: SourceStaging,
    /// Operator-configured upload command; targets are appended to it
    pub upload_command: Option<&'a str>,
}

/// Render the build script for `job`
pub fn generate(job: &Job, ctx: &ScriptContext<'_>) -> String {
    let mut script = String::new();

    script.push_str("#!/usr/bin/env bash\n");
    let _ = writeln!(script, "# Build script for job {}", job.job_id);
    script.push('\n');

    for (key, value) in exports(job, ctx) {
        let _ = writeln!(script, "export {}={}", key, quote(&value));
    }
    script.push('\n');

    let _ = writeln!(
        script,
        "buildq_section() {{\n    echo \"{}$1\"\n}}\n",
        SECTION_MARKER
    );
    script.push_str("buildq_step() {\n    printf '+ %s\\n' \"$1\"\n    ( eval \"$1\" )\n}\n\n");

    script.push_str(&fetch_function(&ctx.source));
    script.push('\n');

    for phase in Phase::ALL {
        let mut commands: Vec<String> = job
            .instructions
            .get(phase)
            .map(|cmd| cmd.commands().into_iter().map(str::to_string).collect())
            .unwrap_or_default();
        if phase == Phase::AfterSuccess {
            commands.extend(upload_commands(job, ctx.upload_command));
        }
        script.push_str(&phase_function(phase, &commands));
        script.push('\n');
    }

    let _ = write!(
        script,
        r#"if ! buildq_fetch; then
    phase_after_error
    phase_after_script
    exit {error}
fi

if ! phase_install; then
    phase_after_error
    phase_after_script
    exit {error}
fi

if ! phase_test || ! phase_before_script || ! phase_script; then
    phase_after_failure
    phase_after_script
    exit {failure}
fi

phase_after_success
phase_after_script
exit {success}
"#,
        error = EXIT_ERROR,
        failure = EXIT_FAILURE,
        success = EXIT_SUCCESS,
    );

    script
}

fn exports(job: &Job, ctx: &ScriptContext<'_>) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = vec![
        ("CI".into(), "true".into()),
        ("BUILD_JOB_ID".into(), job.job_id.clone()),
        ("BUILD_JOB_NAME".into(), job.job_name.clone()),
        ("BUILD_NO".into(), job.build_no.to_string()),
        ("BUILD_SUB_NO".into(), job.sub_build_no.to_string()),
        ("BUILD_NUMBER".into(), job.build_number()),
        ("BUILD_PLATFORM".into(), job.platform.clone()),
        ("BUILD_ENGINE".into(), job.engine.clone()),
        ("BUILD_OWNER".into(), job.owner.clone()),
        ("BUILD_PACKAGE".into(), job.package.clone()),
        ("BUILD_QUEUE".into(), ctx.queue.to_string()),
        ("BUILD_WORKER_ID".into(), ctx.worker_id.to_string()),
        ("BUILD_UPLOAD_TOKEN".into(), job.upload_token.clone()),
        (
            "BUILD_UPLOAD_LABELS".into(),
            job.instructions.upload_labels.join(","),
        ),
    ];
    if let Some(token) = &job.git_oauth_token {
        vars.push(("BUILD_GIT_OAUTH_TOKEN".into(), token.clone()));
    }
    vars.extend(parse_env(&job.env));
    vars
}

fn fetch_function(source: &SourceStaging) -> String {
    match source {
        SourceStaging::None => "buildq_fetch() { :; }\n".to_string(),
        SourceStaging::Tarball => format!(
            "buildq_fetch() {{\n    echo \"Extracting build source\"\n    mkdir -p {dir} && tar -xf {tarball} -C {dir} && cd {dir}\n}}\n",
            dir = SOURCE_DIR,
            tarball = SOURCE_TARBALL,
        ),
        SourceStaging::Git { url, branch } => {
            let branch = branch
                .as_deref()
                .map(|b| format!(" --branch {}", quote(b)))
                .unwrap_or_default();
            format!(
                r#"buildq_fetch() {{
    echo "Cloning {display}"
    if [ -n "${{BUILD_GIT_OAUTH_TOKEN:-}}" ]; then
        git -c "http.extraHeader=Authorization: token ${{BUILD_GIT_OAUTH_TOKEN}}" clone --depth 1{branch} {url} {dir} || return $?
    else
        git clone --depth 1{branch} {url} {dir} || return $?
    fi
    cd {dir}
}}
"#,
                display = url.replace('"', ""),
                url = quote(url),
                branch = branch,
                dir = SOURCE_DIR,
            )
        }
    }
}

fn phase_function(phase: Phase, commands: &[String]) -> String {
    if commands.is_empty() {
        return format!("phase_{}() {{ :; }}\n", phase);
    }

    let mut body = format!("phase_{}() {{\n    buildq_section {}\n", phase, phase);
    for command in commands {
        let _ = writeln!(body, "    buildq_step {} || return $?", quote(command));
    }
    body.push_str("}\n");
    body
}

fn upload_commands(job: &Job, upload_command: Option<&str>) -> Vec<String> {
    let Some(upload) = upload_command.filter(|c| !c.trim().is_empty()) else {
        return Vec::new();
    };

    let labels: String = job
        .instructions
        .upload_labels
        .iter()
        .map(|label| format!(" --label {}", quote(label)))
        .collect();

    job.instructions
        .build_targets
        .iter()
        .filter(|target| !target.trim().is_empty())
        .map(|target| format!("{}{} {}", upload.trim(), labels, quote(target)))
        .collect()
}

/// Quote a value for bash
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Parse a job environment string of whitespace-separated `KEY=VALUE` words.
///
/// Single and double quotes group words the way a shell would. Words without
/// `=` or with an invalid variable name are skipped with a warning.
pub fn parse_env(env: &str) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    for word in split_words(env) {
        let Some((key, value)) = word.split_once('=') else {
            warn!(word = %word, "Ignoring env entry without '='");
            continue;
        };
        if !is_valid_name(key) {
            warn!(key = %key, "Ignoring env entry with invalid name");
            continue;
        }
        vars.push((key.to_string(), value.to_string()));
    }
    vars
}

fn is_valid_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn split_words(input: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Plain,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut state = State::Plain;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Plain => match c {
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '\'' => {
                    state = State::Single;
                    in_word = true;
                }
                '"' => {
                    state = State::Double;
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            State::Single => match c {
                '\'' => state = State::Plain,
                c => current.push(c),
            },
            State::Double => match c {
                '"' => state = State::Plain,
                '\\' => match chars.peek() {
                    Some(&next) if matches!(next, '"' | '\\' | '$' | '`') => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                c => current.push(c),
            },
        }
    }

    if state != State::Plain {
        warn!("Unterminated quote in env string");
    }
    if in_word {
        words.push(current);
    }
    words
}
