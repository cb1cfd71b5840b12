use std::{
    io::{BufRead, BufReader, Read},
    process::{Command, ExitStatus, Stdio},
};

use parking_lot::Mutex;

/// How many trailing lines of output are kept as a failure diagnostic.
const DIAGNOSTIC_LINES: usize = 20;

/// Output of a command run through [`run_logged`].
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    /// stdout and stderr interleaved in arrival order, ANSI escapes removed.
    pub logs: String,
}

impl Captured {
    /// Last few lines of output, which is usually where tools put the reason they failed.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        let lines = self.logs.lines().collect::<Vec<_>>();
        let skip = lines.len().saturating_sub(DIAGNOSTIC_LINES);
        lines[skip..].join("\n")
    }
}

fn pump<R: Read>(reader: R, logs: &Mutex<String>, mut on_line: impl FnMut(&str)) -> String {
    let mut collected = String::new();
    for line in BufReader::new(reader).split(b'\n').map_while(Result::ok) {
        let line = String::from_utf8_lossy(&strip_ansi_escapes::strip(&line)).into_owned();
        on_line(&line);
        collected += &line;
        collected.push('\n');
        let mut logs = logs.lock();
        *logs += &line;
        logs.push('\n');
    }
    collected
}

/// Run `cmd`, streaming its output into the log while capturing it.
///
/// # Errors
/// - the command cannot be spawned or waited on
pub fn run_logged(msg: &str, cmd: &mut Command) -> std::io::Result<Captured> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = (child.stdout.take()).ok_or_else(|| std::io::Error::other("stdout not piped"))?;
    let stderr = (child.stderr.take()).ok_or_else(|| std::io::Error::other("stderr not piped"))?;
    let logs = Mutex::new(String::new());

    tracing::debug!("┌─ BEGIN: {msg}");
    // output belongs to the caller's stage, not to a bare thread
    let span = tracing::Span::current();
    let (status, stdout) = std::thread::scope(|s| {
        let out = s.spawn(|| {
            let _entered = span.enter();
            pump(stdout, &logs, |line| tracing::debug!(" │ {line}"))
        });
        s.spawn(|| {
            let _entered = span.enter();
            pump(stderr, &logs, |line| tracing::debug!("!│ {line}"));
        });
        let status = child.wait();
        let stdout = out.join().unwrap_or_default();
        (status, stdout)
    });
    tracing::debug!("└─ END OF {msg}");

    Ok(Captured {
        status: status?,
        stdout,
        logs: logs.into_inner(),
    })
}
