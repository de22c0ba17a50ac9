//! Interactive command shell.
//!
//! The shell is a two-level REPL. The root level only knows
//! `initialize` and `exit`; `initialize` builds the emulator from the
//! loaded configuration and enters the main level:
//!
//! | command | effect |
//! |---|---|
//! | `scheduler-test` | start the random process generator |
//! | `scheduler-stop` | stop the generator |
//! | `screen -ls` | list cores and process states |
//! | `screen -s <name> <mem>` | admit a sample process and attach |
//! | `screen -c <name> <mem> "<program>"` | admit a program and return |
//! | `screen -r <name>` | attach to a running process |
//! | `process-smi` | utilization and memory summary |
//! | `vmstat` | detailed memory statistics |
//! | `report-util` | write `Process-Report.txt` |
//! | `exit` | shut the emulator down |
//!
//! An attached screen has its own prompt with `process-smi` (show the
//! process log) and `exit` (detach).

use std::io::{self, BufRead, Write};
use std::path::Path;

use crate::config::Config;
use crate::emu::Emu;
use crate::report;

/// Run the shell until `exit` at the root level or end of input.
pub fn run(config: Config) -> crate::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    println!("osmux - process multiplexer and virtual memory emulator");
    println!("type `initialize` to boot, `exit` to quit");

    while let Some(line) = prompt(&mut lines, "root")? {
        match line.as_str() {
            "" => {}
            "initialize" => initialized_loop(&mut lines, config.clone())?,
            "exit" => break,
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}

/// The main command loop over a live emulator. Leaving it shuts the
/// emulator down.
fn initialized_loop(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    config: Config,
) -> crate::Result<()> {
    let emu = Emu::new(config)?;

    while let Some(line) = prompt(lines, "initialized")? {
        match line.as_str() {
            "" => {}
            "scheduler-test" => emu.start_generator()?,
            "scheduler-stop" => emu.stop_generator(),
            "vmstat" => print!("{}", report::vmstat(&emu)),
            "process-smi" => print!("{}", report::process_smi(&emu)),
            "report-util" => {
                report::write_report(&emu, Path::new(report::REPORT_PATH))?;
                println!("report written to {}", report::REPORT_PATH);
            }
            "exit" => break,
            other => {
                let tokens = split_command(other);
                if tokens.first().map(String::as_str) == Some("screen") {
                    screen_command(lines, &emu, &tokens)?;
                } else {
                    println!("unknown command: {other}");
                }
            }
        }
    }

    emu.shutdown();
    Ok(())
}

/// Dispatch the `screen` subcommands.
fn screen_command(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    emu: &Emu,
    tokens: &[String],
) -> crate::Result<()> {
    match tokens {
        [_, flag] if flag == "-ls" => {
            print!("{}", report::status(emu));
        }
        [_, flag, name, memory] if flag == "-s" => {
            let Some(memory) = parse_memory(memory) else {
                return Ok(());
            };
            emu.admit_random(name, memory)?;
            screen_session(lines, emu, name)?;
        }
        [_, flag, name, memory, program] if flag == "-c" => {
            let Some(memory) = parse_memory(memory) else {
                return Ok(());
            };
            emu.admit_source(name, memory, program)?;
        }
        [_, flag, name] if flag == "-r" => {
            if emu.is_contained(name) && emu.is_running(name) {
                screen_session(lines, emu, name)?;
            } else {
                println!("Process [{name}] not found");
            }
        }
        _ => println!("usage: screen -ls | -s <name> <mem> | -c <name> <mem> \"<program>\" | -r <name>"),
    }
    Ok(())
}

/// Attached-process prompt: `process-smi` shows the log, `exit` detaches.
fn screen_session(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    emu: &Emu,
    name: &str,
) -> crate::Result<()> {
    while let Some(line) = prompt(lines, name)? {
        match line.as_str() {
            "" => {}
            "process-smi" => match report::process_screen(emu, name) {
                Some(text) => print!("{text}"),
                None => println!("Process [{name}] not found"),
            },
            "exit" => break,
            other => println!("unknown command: {other}"),
        }
    }
    Ok(())
}

/// Print a prompt and read one trimmed line. `None` at end of input.
fn prompt(
    lines: &mut impl Iterator<Item = io::Result<String>>,
    name: &str,
) -> crate::Result<Option<String>> {
    print!("{name}> ");
    io::stdout().flush()?;
    match lines.next() {
        Some(line) => Ok(Some(line?.trim().to_string())),
        None => Ok(None),
    }
}

/// Split a command line on whitespace, keeping double-quoted spans
/// together (quotes removed). `screen -c p 64 "DECLARE(X, 1)"` yields
/// four tokens plus the whole program string.
fn split_command(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(current.clone());
                    current.clear();
                }
                in_quotes = !in_quotes;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(current.clone());
                    current.clear();
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn parse_memory(token: &str) -> Option<usize> {
    match token.parse() {
        Ok(bytes) => Some(bytes),
        Err(_) => {
            println!("invalid memory size: {token}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_command() {
        assert_eq!(
            split_command("screen -ls"),
            vec!["screen".to_string(), "-ls".to_string()]
        );
    }

    #[test]
    fn test_split_quoted_program() {
        let tokens = split_command("screen -c job 64 \"DECLARE(X, 1); PRINT(\"");
        assert_eq!(tokens[0], "screen");
        assert_eq!(tokens[1], "-c");
        assert_eq!(tokens[2], "job");
        assert_eq!(tokens[3], "64");
        assert_eq!(tokens[4], "DECLARE(X, 1); PRINT(");
    }

    #[test]
    fn test_split_collapses_whitespace() {
        assert_eq!(
            split_command("  screen   -r   name  "),
            vec!["screen".to_string(), "-r".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("64"), Some(64));
        assert_eq!(parse_memory("lots"), None);
    }
}
