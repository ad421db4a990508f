use std::io::{self, BufRead, Write};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::output::ExecutionResult;
use crate::session::StataSession;

pub fn run(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!(
        "debug repl: timeout={:.1}s | end input with END | commands: INTERRUPT, RESTART, VERSION | Ctrl-D to exit",
        config.execute_timeout.as_secs_f64(),
    );

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    let session = StataSession::new(config);
    session.start()?;
    writeln!(
        stderr,
        "[stata-repl] started {} (pid {})",
        session.executable().display(),
        session
            .pid()
            .map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
    )?;

    let stdin = io::stdin();
    let mut stdin = stdin.lock();

    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };

        if is_exact_command(&line, "INTERRUPT") {
            report_control(session.interrupt(), "interrupt sent", &mut stderr)?;
            continue;
        }
        if is_exact_command(&line, "RESTART") {
            report_control(session.restart(), "session restarted", &mut stderr)?;
            continue;
        }
        if is_exact_command(&line, "VERSION") {
            let version = session.get_version()?;
            writeln!(stdout, "{version}")?;
            continue;
        }

        let (chunk, done) = split_end_marker(&line);
        let mut input = chunk;
        if !done {
            loop {
                let Some(next) = read_line(&mut stdin)? else {
                    return Err("EOF reached while reading input; expected END".into());
                };
                let (chunk, done) = split_end_marker(&next);
                input.push_str(&chunk);
                if done {
                    break;
                }
            }
        }
        if input.trim().is_empty() {
            continue;
        }

        match session.execute(&input) {
            Ok(result) => render_result(&result, &mut stdout, &mut stderr)?,
            Err(err @ (SessionError::NotReady | SessionError::Io(_))) => {
                writeln!(stderr, "[stata-repl] session error: {err}")?;
            }
            Err(err) => return Err(err.into()),
        }
    }

    session.shutdown()?;
    Ok(())
}

fn report_control(
    outcome: Result<(), SessionError>,
    done: &str,
    stderr: &mut impl Write,
) -> io::Result<()> {
    match outcome {
        Ok(()) => writeln!(stderr, "[stata-repl] {done}"),
        Err(err) => writeln!(stderr, "[stata-repl] session error: {err}"),
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn is_exact_command(line: &str, command: &str) -> bool {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    trimmed == command
}

fn split_end_marker(line: &str) -> (String, bool) {
    let (body, newline) = split_line_ending(line);
    if let Some(prefix) = body.strip_suffix("END") {
        return (format!("{prefix}{newline}"), true);
    }
    (line.to_string(), false)
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(stripped) = line.strip_suffix("\r\n") {
        (stripped, "\n")
    } else if let Some(stripped) = line.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (line, "")
    }
}

fn render_result(
    result: &ExecutionResult,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> io::Result<()> {
    if !result.output.is_empty() {
        writeln!(stdout, "{}", result.output)?;
    }
    if result.is_error {
        writeln!(
            stderr,
            "[stata-repl] error r({}): {}",
            result.error_code, result.error_message
        )?;
    }
    for path in &result.graph_files {
        writeln!(
            stderr,
            "[stata-repl] graph {path} ({})",
            crate::graphics::mime_type_for(std::path::Path::new(path))
        )?;
    }
    stdout.flush()?;
    stderr.flush()?;
    Ok(())
}
