//! REPL – operator console for a running singulation session.
//!
//! Supported slash-commands:
//!   /help                          – show this list
//!   /status                        – machine, safety and per-axis status
//!   /start  /stop  /reset          – governor commands
//!   /estop                         – emergency stop
//!   /frame <seq> <rpm...> [| <eject rpm...>] – submit one upstream frame
//!   /heartbeat                     – send one upstream heartbeat
//!   /quit | /exit                  – shut the session down and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use singula_runtime::SingulationSession;
use singula_types::{DriverStatus, SafetyIsolationState, SpeedSet, SystemState};
use tokio::runtime::Runtime;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Start,
    Stop,
    EmergencyStop,
    Reset,
    Frame {
        sequence: i64,
        main: Vec<i32>,
        eject: Vec<i32>,
    },
    Heartbeat,
    Quit,
}

/// Parse one input line.  `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let command = match head {
        "/help" => Command::Help,
        "/status" => Command::Status,
        "/start" => Command::Start,
        "/stop" => Command::Stop,
        "/estop" => Command::EmergencyStop,
        "/reset" => Command::Reset,
        "/heartbeat" => Command::Heartbeat,
        "/quit" | "/exit" => Command::Quit,
        "/frame" => {
            let sequence = words
                .next()
                .ok_or("usage: /frame <seq> <rpm...> [| <eject rpm...>]")?
                .parse::<i64>()
                .map_err(|e| format!("bad sequence: {e}"))?;
            let (mut main, mut eject) = (Vec::new(), Vec::new());
            let mut target = &mut main;
            for word in words {
                if word == "|" {
                    target = &mut eject;
                    continue;
                }
                target.push(word.parse::<i32>().map_err(|e| format!("bad rpm '{word}': {e}"))?);
            }
            Command::Frame { sequence, main, eject }
        }
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

/// Run the console until `/quit`, EOF, or `shutdown` is raised.
pub fn run(session: &SingulationSession, rt: &Runtime, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "singula>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let command = match parse_command(&line) {
            Ok(Some(c)) => c,
            Ok(None) => continue,
            Err(msg) => {
                println!("{} Type {} for available commands.", msg.red(), "/help".bold());
                continue;
            }
        };

        match command {
            Command::Help => cmd_help(),
            Command::Status => cmd_status(session),
            Command::Start => {
                session.start("operator console");
                settle_and_report(session, rt);
            }
            Command::Stop => {
                session.stop("operator console");
                settle_and_report(session, rt);
            }
            Command::EmergencyStop => {
                session.emergency_stop("operator console");
                settle_and_report(session, rt);
            }
            Command::Reset => {
                session.reset("operator console");
                settle_and_report(session, rt);
            }
            Command::Frame { sequence, main, eject } => {
                let decision = session.submit_frame(SpeedSet {
                    timestamp: Utc::now(),
                    sequence,
                    main,
                    eject,
                });
                match (decision.accepted, decision.reason) {
                    (true, _) if decision.degraded => println!(
                        "  {} scaled to {:?} {:?}",
                        "degraded".yellow(),
                        decision.effective_set.main,
                        decision.effective_set.eject
                    ),
                    (true, _) => println!("  {}", "accepted".green()),
                    (false, Some(reason)) => println!("  {} ({reason})", "rejected".red()),
                    (false, None) => println!("  {}", "rejected".red()),
                }
            }
            Command::Heartbeat => {
                session.heartbeat(b"console");
                println!("  {}", "heartbeat sent".dimmed());
            }
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "Singula Commands".bold().underline());
    println!("  {}              – machine, safety and axis status", "/status".bold().cyan());
    println!("  {}  – governor commands", "/start  /stop  /reset".bold().cyan());
    println!("  {}               – emergency stop", "/estop".bold().cyan());
    println!("  {} – submit one frame", "/frame <seq> <rpm...> [| <eject...>]".bold().cyan());
    println!("  {}           – send one upstream heartbeat", "/heartbeat".bold().cyan());
    println!("  {}        – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_status(session: &SingulationSession) {
    let system = match session.system_state() {
        s @ SystemState::Running => format!("{s:?}").green(),
        s @ SystemState::Alarm => format!("{s:?}").red().bold(),
        s => format!("{s:?}").yellow(),
    };
    let safety = match session.safety_state() {
        s @ SafetyIsolationState::Normal => format!("{s:?}").green(),
        s @ SafetyIsolationState::Degraded => format!("{s:?}").yellow(),
        s @ SafetyIsolationState::Isolated => format!("{s:?}").red().bold(),
    };
    println!("{}", "Status".bold().underline());
    println!("  Machine : {system}");
    println!("  Safety  : {safety}");

    let drives = session.controller().drives();
    println!("  Axes    : {}", drives.len());
    for drive in drives {
        let status = drive.status();
        let label = format!("{status:?}");
        let label = match status {
            DriverStatus::Connected | DriverStatus::Disabled => label.green(),
            DriverStatus::Faulted | DriverStatus::Disconnected => label.red(),
            _ => label.yellow(),
        };
        println!("    {} node {:>3}  {}", drive.axis_id(), drive.node_id(), label);
    }

    let m = session.frame_metrics();
    println!(
        "  Frames  : {} accepted, {} isolated, {} duplicate, {} degraded (last deviation {:.1} rpm)",
        m.accepted, m.rejected_isolated, m.rejected_duplicate, m.degraded_frames, m.last_mean_deviation
    );
}

fn settle_and_report(session: &SingulationSession, rt: &Runtime) {
    rt.block_on(session.settle());
    println!(
        "  machine {} / safety {}",
        format!("{:?}", session.system_state()).bold(),
        format!("{:?}", session.safety_state()).bold()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_command("   \n"), Ok(None));
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse_command("/estop\n"), Ok(Some(Command::EmergencyStop)));
        assert_eq!(parse_command("/exit"), Ok(Some(Command::Quit)));
        assert!(parse_command("/launch").is_err());
    }

    #[test]
    fn frame_with_main_and_eject() {
        assert_eq!(
            parse_command("/frame 12 100 -200 | 50"),
            Ok(Some(Command::Frame {
                sequence: 12,
                main: vec![100, -200],
                eject: vec![50],
            }))
        );
    }

    #[test]
    fn frame_needs_numeric_fields() {
        assert!(parse_command("/frame").is_err());
        assert!(parse_command("/frame x 100").is_err());
        assert!(parse_command("/frame 3 fast").is_err());
    }
}
