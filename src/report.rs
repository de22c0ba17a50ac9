//! Report formatting: `vmstat`, `process-smi`, `screen -ls` and the
//! on-disk process report.
//!
//! All functions render from live [`Emu`] queries; nothing here holds
//! state. Output is laid out in 60-column banner blocks.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Local;

use crate::emu::Emu;
use crate::pcb::ProcessState;

/// Default path of the process report file.
pub const REPORT_PATH: &str = "Process-Report.txt";

const LINE_WIDTH: usize = 60;
const COLUMN_WIDTH: usize = LINE_WIDTH / 2;

fn center(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let padding = width - text.len();
    let left = padding / 2;
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(padding - left))
}

fn banner(title: &str) -> String {
    let rule = "-".repeat(LINE_WIDTH);
    format!("{rule}\n|{}|\n{rule}\n", center(title, LINE_WIDTH - 2))
}

fn row(label: &str, value: &str) -> String {
    format!("{label:<width$}{value:<width$}\n", width = COLUMN_WIDTH)
}

/// Detailed memory and CPU-time statistics (the `vmstat` command).
pub fn vmstat(emu: &Emu) -> String {
    let stats = emu.memory_stats();
    let (active_ticks, total_ticks) = emu.cpu_ticks();
    let used = stats.total_bytes - stats.available_bytes;

    let mut out = banner("Detailed Memory Visualization");
    out.push_str(&row("Total Memory", &stats.total_bytes.to_string()));
    out.push_str(&row("Used Memory", &used.to_string()));
    out.push_str(&row("Free Memory", &stats.available_bytes.to_string()));
    out.push_str(&row(
        "Idle CPU Ticks",
        &(total_ticks - active_ticks).to_string(),
    ));
    out.push_str(&row("Active CPU Ticks", &active_ticks.to_string()));
    out.push_str(&row("Total CPU Ticks", &total_ticks.to_string()));
    out.push_str(&row("Pages Paged In", &stats.pages_in.to_string()));
    out.push_str(&row("Pages Paged Out", &stats.pages_out.to_string()));
    out.push_str(&"-".repeat(LINE_WIDTH));
    out.push('\n');
    out
}

/// Utilization and memory summary (the root `process-smi` command).
pub fn process_smi(emu: &Emu) -> String {
    let stats = emu.memory_stats();
    let used = stats.total_bytes - stats.available_bytes;
    let memory_util = used as f64 / stats.total_bytes as f64 * 100.0;

    let mut out = banner("PROCESS-SMI");
    out.push_str(&row(
        "CPU Util",
        &format!(": {:.2}%", emu.average_utilization()),
    ));
    out.push_str(&row(
        "Memory Usage",
        &format!(": {used} bytes / {} bytes", stats.total_bytes),
    ));
    out.push_str(&row("Memory Util", &format!(": {memory_util:.2}%")));
    out.push('\n');

    out.push_str(&banner("Running Processes and Memory Usage"));
    for (name, bytes) in emu.running_processes_memory() {
        if bytes != 0 {
            out.push_str(&row(&name, &format!("{bytes} bytes")));
        }
    }
    out.push_str(&"-".repeat(LINE_WIDTH));
    out.push('\n');
    out
}

/// Core usage, utilization and process-state listing (the `screen -ls`
/// command and the body of the report file).
pub fn status(emu: &Emu) -> String {
    let (used, available) = emu.cores_used();

    let mut running = String::new();
    let mut terminated = String::new();
    for process in emu.snapshot() {
        if process.state == ProcessState::Terminated {
            terminated.push_str(&process.name);
            terminated.push('\n');
        } else {
            running.push_str(&process.name);
            running.push('\n');
        }
    }

    let mut out = String::new();
    out.push_str(&format!("Cores Used: {used}\n"));
    out.push_str(&format!("Cores Available: {available}\n"));
    out.push_str(&format!(
        "Utilization: {:.2}%\n\n",
        emu.average_utilization()
    ));
    out.push_str("Running Processes:\n");
    out.push_str(&running);
    out.push_str("\nTerminated Processes:\n");
    out.push_str(&terminated);
    out
}

/// Per-process screen: id, name and log (the in-screen `process-smi`
/// command). `None` when no such process exists.
pub fn process_screen(emu: &Emu, name: &str) -> Option<String> {
    let (pid, state, log) = emu.process_log(name)?;
    let (used, available) = emu.cores_used();

    let mut out = String::new();
    out.push_str(&format!("Cores Used: {used}\n"));
    out.push_str(&format!("Cores Available: {available}\n\n"));
    out.push_str(&format!("Process ID: {pid}\n"));
    out.push_str(&format!("Process Name: {name}\n\n"));
    out.push_str(&log);
    if state == ProcessState::Terminated {
        out.push_str("\nTERMINATED\n");
    }
    Some(out)
}

/// Write the utilization report file.
pub fn write_report(emu: &Emu, path: &Path) -> crate::Result<()> {
    let mut file = File::create(path)?;
    writeln!(
        file,
        "Report generated at {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    file.write_all(status(emu).as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::Config;
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_emu() -> Emu {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut config = Config::default();
        config.memory_per_frame = 4;
        config.max_overall_memory = 8;
        config.backing_store = std::env::temp_dir().join(format!(
            "osmux-report-test-{}-{n}.txt",
            process::id()
        ));

        let clock = Arc::new(Clock::new());
        clock.start_with_period(Duration::from_millis(1));
        Emu::with_clock(config, clock).expect("build emulator")
    }

    #[test]
    fn test_vmstat_fields() {
        let emu = fast_emu();
        let out = vmstat(&emu);
        assert!(out.contains("Total Memory"));
        assert!(out.contains("256"));
        assert!(out.contains("Free Memory"));
        assert!(out.contains("Pages Paged In"));
        assert!(out.contains("Pages Paged Out"));
    }

    #[test]
    fn test_process_smi_shape() {
        let emu = fast_emu();
        let out = process_smi(&emu);
        assert!(out.contains("PROCESS-SMI"));
        assert!(out.contains("CPU Util"));
        assert!(out.contains("Memory Usage"));
        assert!(out.contains("0 bytes / 256 bytes"));
    }

    #[test]
    fn test_status_lists_processes() {
        let emu = fast_emu();
        emu.admit("listed", 16, Vec::new()).expect("admit");
        let out = status(&emu);
        assert!(out.contains("Cores Used"));
        assert!(out.contains("listed"));
    }

    #[test]
    fn test_process_screen() {
        let emu = fast_emu();
        emu.admit("shown", 16, Vec::new()).expect("admit");
        let out = process_screen(&emu, "shown").expect("screen");
        assert!(out.contains("Process ID: 0"));
        assert!(out.contains("Process Name: shown"));
        assert!(process_screen(&emu, "missing").is_none());
    }

    #[test]
    fn test_write_report() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let emu = fast_emu();
        let path = std::env::temp_dir().join(format!(
            "osmux-report-out-{}-{n}.txt",
            process::id()
        ));

        write_report(&emu, &path).expect("write report");
        let text = std::fs::read_to_string(&path).expect("read report");
        assert!(text.contains("Report generated at"));
        assert!(text.contains("Running Processes:"));
        assert!(text.contains("Terminated Processes:"));
    }
}
