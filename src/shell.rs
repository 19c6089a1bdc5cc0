//! Interactive command shell.
//!
//! Thin glue over the kernel API: parses commands, prints results, and owns
//! the scheduler thread's lifetime. All commands except `initialize`,
//! `help`, and `exit` require a prior successful `initialize`.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{self, Config};
use crate::io::backing_store::{BackingStore, BACKING_STORE_FILE};
use crate::io::report::{self, REPORT_FILE};
use crate::kernel::driver::Driver;
use crate::kernel::generator::Generator;
use crate::kernel::process::{Instruction, Process, ProcessSnapshot, ProcessState};
use crate::kernel::scheduler::{Scheduler, SchedulerHandle};

pub struct Shell {
    driver: Option<Arc<Driver>>,
    scheduler: Option<SchedulerHandle>,
}

impl Shell {
    pub fn new() -> Shell {
        Shell {
            driver: None,
            scheduler: None,
        }
    }

    pub fn run(&mut self) {
        print_banner();
        loop {
            print!("> ");
            let _ = std::io::stdout().flush();

            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    log::error!("stdin read failed: {}", err);
                    break;
                }
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !self.handle_line(line) {
                break;
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(driver) = &self.driver {
            driver.request_shutdown();
        }
        if let Some(handle) = self.scheduler.take() {
            handle.join();
        }
        // Processes die with the emulator: release frames and page tables.
        if let Some(driver) = self.driver.take() {
            for snap in driver.snapshots() {
                driver.memory.deallocate(snap.id);
            }
        }
    }

    /// Returns false when the shell should exit.
    fn handle_line(&mut self, line: &str) -> bool {
        let (command, rest) = split_command(line);

        match command {
            "exit" => return false,
            "help" => {
                print_help();
                return true;
            }
            "initialize" => {
                if let Err(err) = self.cmd_initialize() {
                    println!("initialize failed: {:#}", err);
                }
                return true;
            }
            _ => {}
        }

        let Some(driver) = self.driver.clone() else {
            println!("Emulator not initialized.");
            return true;
        };

        match command {
            "screen" => cmd_screen(&driver, rest),
            "scheduler-start" => {
                driver.start_generation();
                println!("Process generation started.");
            }
            "scheduler-stop" => {
                driver.stop_generation();
                println!("Process generation stopped.");
            }
            "report-util" => match report::write_report(&driver, REPORT_FILE) {
                Ok(()) => println!("Report saved to {}.", REPORT_FILE),
                Err(err) => println!("report-util failed: {}", err),
            },
            "process-smi" => cmd_process_smi(&driver),
            "vmstat" => cmd_vmstat(&driver),
            _ => println!("Unknown command: {}", command),
        }
        true
    }

    fn cmd_initialize(&mut self) -> Result<()> {
        if self.driver.is_some() {
            println!("Already initialized.");
            return Ok(());
        }

        let cfg = Config::load(config::CONFIG_FILE)?;
        let store = BackingStore::create(BACKING_STORE_FILE)
            .with_context(|| format!("cannot create {}", BACKING_STORE_FILE))?;
        let driver = Driver::new(cfg, store);
        let handle =
            Scheduler::spawn(driver.clone()).context("cannot start scheduler thread")?;

        self.driver = Some(driver);
        self.scheduler = Some(handle);
        println!("Initialized.");
        Ok(())
    }
}

impl Default for Shell {
    fn default() -> Shell {
        Shell::new()
    }
}

fn cmd_screen(driver: &Arc<Driver>, rest: &str) {
    let (sub, args) = split_command(rest);
    let result = match sub {
        "-s" => screen_create(driver, args),
        "-c" => screen_create_custom(driver, args),
        "-r" => screen_attach(driver, args),
        "-ls" => {
            print!("{}", report::render(driver));
            Ok(())
        }
        _ => Err(anyhow!(
            "usage: screen -s <name> <memsize> | -c <name> <memsize> \"<instructions>\" | -r <name> | -ls"
        )),
    };
    if let Err(err) = result {
        println!("{:#}", err);
    }
}

/// `screen -s <name> <memsize>`: admit a process with a synthesized
/// instruction stream.
fn screen_create(driver: &Arc<Driver>, args: &str) -> Result<()> {
    let (name, mem_size) = parse_name_and_memsize(args)?;
    let mut generator = Generator::new();
    let pid = driver.next_pid();
    let process = generator.synthesize(pid, name.as_str(), mem_size, driver.cfg());
    driver.admit(process);
    println!("Process {} created.", name);
    Ok(())
}

/// `screen -c <name> <memsize> "<instructions>"`: admit a user program.
fn screen_create_custom(driver: &Arc<Driver>, args: &str) -> Result<()> {
    let (name, rest) = split_command(args);
    let (mem_token, quoted) = split_command(rest);
    if name.is_empty() || mem_token.is_empty() {
        bail!("usage: screen -c <name> <memsize> \"<instructions>\"");
    }
    let mem_size = parse_mem_size(mem_token)?;
    let source = unquote(quoted)?;
    let instructions =
        Instruction::parse_program(source).map_err(|e| anyhow!("invalid program: {}", e))?;

    let pid = driver.next_pid();
    let process = Process::new(pid, name, instructions, mem_size);
    driver.admit(process);
    println!("Process {} created.", name);
    Ok(())
}

/// `screen -r <name>`: attach a mini console to one process.
fn screen_attach(driver: &Arc<Driver>, args: &str) -> Result<()> {
    let name = args.trim();
    if name.is_empty() {
        bail!("usage: screen -r <name>");
    }
    if driver.find_process(name, |_| ()).is_none() {
        bail!("process {} not found", name);
    }

    println!("Attached to {}. Commands: process-smi, exit.", name);
    loop {
        print!("{}> ", name);
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        match line.trim() {
            "process-smi" => match driver.find_process(name, Process::snapshot) {
                Some(snap) => print_process_detail(&snap),
                None => println!("process {} no longer exists", name),
            },
            "exit" => break,
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }
    Ok(())
}

fn print_process_detail(snap: &ProcessSnapshot) {
    println!("PID: {}", snap.id);
    println!("State: {}", snap.state.label());
    println!(
        "Instruction: {}/{}",
        snap.current_instruction, snap.total_instructions
    );
    println!("\nVariables:");
    for (name, value) in &snap.variables {
        println!("  {} = {}", name, value);
    }
    println!("\nExecution log:");
    for entry in snap.exec_log.iter().rev().take(10) {
        println!("  {}", entry);
    }
    if snap.state == ProcessState::MemoryViolated {
        println!(
            "\nViolation:\n  {}",
            snap.last_fault().unwrap_or("Memory violation occurred.")
        );
    }
}

fn cmd_process_smi(driver: &Arc<Driver>) {
    let util = driver.cpu_utilization();
    println!("PROCESS-SMI");
    println!("-----------");
    println!(
        "CPU Utilization: {:.2}% ({} used, {} available)\n",
        util.percent, util.cores_used, util.cores_available
    );

    println!("Memory Summary:");
    println!("  Total: {}", format_bytes(driver.memory.total_bytes()));
    println!("  Used : {}", format_bytes(driver.memory.used_bytes()));
    println!("  Free : {}\n", format_bytes(driver.memory.free_bytes()));

    println!("{:<6}{:<20}{:<14}{:<14}", "PID", "NAME", "VM-SIZE", "RSS");
    println!("{}", "-".repeat(54));
    for snap in driver.snapshots() {
        println!(
            "{:<6}{:<20}{:<14}{:<14}",
            snap.id,
            snap.name,
            format_bytes(snap.memory_size as u64),
            format_bytes(driver.memory.resident_bytes(snap.id))
        );
    }
    println!();
}

fn cmd_vmstat(driver: &Arc<Driver>) {
    let total = driver.memory.total_bytes();
    let used = driver.memory.used_bytes();
    let free = driver.memory.free_bytes();
    let idle = driver.stats.idle_ticks();
    let active = driver.stats.active_ticks();

    println!("VMSTAT");
    println!("------");
    println!("Total memory   : {} bytes ({})", total, format_bytes(total));
    println!("Used memory    : {} bytes ({})", used, format_bytes(used));
    println!("Free memory    : {} bytes ({})\n", free, format_bytes(free));
    println!("Idle cpu ticks  : {}", idle);
    println!("Active cpu ticks: {}", active);
    println!("Total cpu ticks : {}\n", idle + active);
    println!("Num paged in   : {}", driver.stats.paged_in());
    println!("Num paged out  : {}\n", driver.stats.paged_out());
}

fn print_banner() {
    println!("=====================================");
    println!("          CSOPESY OS Emulator        ");
    println!("=====================================");
    println!("Type 'initialize' to start or 'help' for commands.\n");
}

fn print_help() {
    println!("\nAvailable Commands");
    println!("------------------");
    println!("initialize");
    println!("screen -s <name> <memsize>");
    println!("screen -c <name> <memsize> \"<instructions>\"");
    println!("screen -r <name>");
    println!("screen -ls");
    println!("scheduler-start");
    println!("scheduler-stop");
    println!("report-util");
    println!("process-smi");
    println!("vmstat");
    println!("exit\n");
    println!("Inside screen -r:");
    println!("  process-smi");
    println!("  exit\n");
}

fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim_start()),
        None => (line.trim(), ""),
    }
}

fn parse_name_and_memsize(args: &str) -> Result<(String, u32)> {
    let mut tokens = args.split_whitespace();
    let name = tokens.next().ok_or_else(|| anyhow!("missing process name"))?;
    let mem = tokens.next().ok_or_else(|| anyhow!("missing memory size"))?;
    if tokens.next().is_some() {
        bail!("unexpected trailing arguments");
    }
    Ok((name.to_string(), parse_mem_size(mem)?))
}

fn parse_mem_size(token: &str) -> Result<u32> {
    let size: u32 = token
        .parse()
        .map_err(|_| anyhow!("invalid memory size '{}'", token))?;
    if !config::is_valid_mem_size(size) {
        bail!("memory size must be a power of two in [64, 65536]");
    }
    Ok(size)
}

fn unquote(text: &str) -> Result<&str> {
    text.trim()
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| anyhow!("instructions must be double-quoted"))
}

fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}
