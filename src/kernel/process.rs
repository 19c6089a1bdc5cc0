//! Process control block and the simulated instruction set.

use std::collections::{HashMap, VecDeque};

use crate::kernel::clock::Tick;

pub type Pid = u32;

/// FOR loops may nest at most this deep; deeper headers are skipped.
pub const MAX_LOOP_DEPTH: usize = 3;

/// Symbol table capacity in bytes; each variable is one u16.
pub const SYMBOL_TABLE_BYTES: u32 = 64;
pub const BYTES_PER_VARIABLE: u32 = 2;

/// Execution log keeps only the most recent entries.
const EXEC_LOG_CAP: usize = 500;

/// User programs submitted through `screen -c` are capped.
pub const MAX_PROGRAM_STATEMENTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Sleeping,
    Finished,
    MemoryViolated,
}

impl ProcessState {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Sleeping => "SLEEPING",
            ProcessState::Finished => "FINISHED",
            ProcessState::MemoryViolated => "MEMORY-VIOLATED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Print,
    Declare,
    Add,
    Subtract,
    Sleep,
    Read,
    Write,
    For,
}

impl Opcode {
    pub fn parse(token: &str) -> Option<Opcode> {
        match token {
            "PRINT" => Some(Opcode::Print),
            "DECLARE" => Some(Opcode::Declare),
            "ADD" => Some(Opcode::Add),
            "SUBTRACT" => Some(Opcode::Subtract),
            "SLEEP" => Some(Opcode::Sleep),
            "READ" => Some(Opcode::Read),
            "WRITE" => Some(Opcode::Write),
            "FOR" => Some(Opcode::For),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Opcode::Print => "PRINT",
            Opcode::Declare => "DECLARE",
            Opcode::Add => "ADD",
            Opcode::Subtract => "SUBTRACT",
            Opcode::Sleep => "SLEEP",
            Opcode::Read => "READ",
            Opcode::Write => "WRITE",
            Opcode::For => "FOR",
        }
    }

    /// Required operand count, or `None` when any count is accepted.
    pub(crate) fn operand_count(&self) -> Option<usize> {
        match self {
            Opcode::Print => None,
            Opcode::Declare => Some(2),
            Opcode::Add | Opcode::Subtract => Some(3),
            Opcode::Sleep => Some(1),
            Opcode::Read | Opcode::Write => Some(2),
            Opcode::For => Some(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(op: Opcode, args: Vec<&str>) -> Instruction {
        Instruction {
            op,
            args: args.into_iter().map(str::to_string).collect(),
        }
    }

    /// Parse one statement, e.g. `ADD x x 1`. PRINT keeps the remainder of
    /// the line as a single argument so messages may contain spaces.
    pub fn parse_statement(statement: &str) -> Result<Instruction, String> {
        let statement = statement.trim();
        let (op_token, rest) = match statement.split_once(char::is_whitespace) {
            Some((op, rest)) => (op, rest.trim_start()),
            None => (statement, ""),
        };

        let op = Opcode::parse(op_token)
            .ok_or_else(|| format!("unknown operation '{}'", op_token))?;

        let args: Vec<String> = match op {
            Opcode::Print if !rest.is_empty() => vec![rest.to_string()],
            Opcode::Print => Vec::new(),
            _ => rest.split_whitespace().map(str::to_string).collect(),
        };

        if let Some(required) = op.operand_count() {
            if args.len() != required {
                return Err(format!(
                    "{} requires {} operand(s), got {}",
                    op.as_str(),
                    required,
                    args.len()
                ));
            }
        }

        Ok(Instruction { op, args })
    }

    /// Parse a semicolon-separated user program (`screen -c` payload).
    pub fn parse_program(source: &str) -> Result<Vec<Instruction>, String> {
        let statements: Vec<&str> = source
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        if statements.is_empty() {
            return Err("program is empty".to_string());
        }
        if statements.len() > MAX_PROGRAM_STATEMENTS {
            return Err(format!(
                "program exceeds {} statements",
                MAX_PROGRAM_STATEMENTS
            ));
        }

        statements
            .into_iter()
            .map(Instruction::parse_statement)
            .collect()
    }
}

/// One active FOR loop. `body_end` is the index of the last instruction in
/// the body, inclusive.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub body_start: usize,
    pub body_end: usize,
    pub iterations_remaining: u32,
}

/// Process control block: everything the emulator knows about one process.
pub struct Process {
    pub id: Pid,
    pub name: String,
    pub state: ProcessState,

    pub instructions: Vec<Instruction>,
    pub current_instruction: usize,
    pub loop_stack: Vec<LoopFrame>,

    pub sleep_until_tick: Tick,
    pub quantum_ticks_left: u32,
    pub delay_ticks_left: u32,
    /// True while stalled on a page fault; the same instruction retries on
    /// the next tick and the quantum is not charged.
    pub is_waiting: bool,

    pub memory_size: u32,
    pub data_memory: HashMap<u32, u16>,

    symbol_table: HashMap<String, u16>,
    symbol_table_bytes_used: u32,

    exec_log: VecDeque<String>,
}

impl Process {
    pub fn new(id: Pid, name: impl Into<String>, instructions: Vec<Instruction>, memory_size: u32) -> Process {
        Process {
            id,
            name: name.into(),
            state: ProcessState::Ready,
            instructions,
            current_instruction: 0,
            loop_stack: Vec::new(),
            sleep_until_tick: 0,
            quantum_ticks_left: 0,
            delay_ticks_left: 0,
            is_waiting: false,
            memory_size,
            data_memory: HashMap::new(),
            symbol_table: HashMap::new(),
            symbol_table_bytes_used: 0,
            exec_log: VecDeque::new(),
        }
    }

    pub fn total_instructions(&self) -> usize {
        self.instructions.len()
    }

    /// Admit `name` into the symbol table. Succeeds if already present or
    /// if two more bytes fit; a full table drops the admission.
    pub fn ensure_slot(&mut self, name: &str) -> bool {
        if self.symbol_table.contains_key(name) {
            return true;
        }
        if self.symbol_table_bytes_used + BYTES_PER_VARIABLE > SYMBOL_TABLE_BYTES {
            log::warn!(
                "[{}] symbol table full, ignoring variable '{}'",
                self.name,
                name
            );
            return false;
        }
        self.symbol_table_bytes_used += BYTES_PER_VARIABLE;
        self.symbol_table.insert(name.to_string(), 0);
        true
    }

    /// Read a variable, auto-admitting a zero-initialized slot when there is
    /// room. Reads of unadmitted names yield 0 without inserting.
    pub fn read_var(&mut self, name: &str) -> u16 {
        if !self.ensure_slot(name) {
            return 0;
        }
        self.symbol_table[name]
    }

    /// Store a value, subject to slot admission. Returns false when dropped.
    pub fn set_var(&mut self, name: &str, value: u16) -> bool {
        if !self.ensure_slot(name) {
            return false;
        }
        self.symbol_table.insert(name.to_string(), value);
        true
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.symbol_table.contains_key(name)
    }

    pub fn symbol_bytes_used(&self) -> u32 {
        self.symbol_table_bytes_used
    }

    /// Variables sorted by name, for display.
    pub fn variables(&self) -> Vec<(String, u16)> {
        let mut vars: Vec<(String, u16)> = self
            .symbol_table
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        vars.sort();
        vars
    }

    pub fn log_event(&mut self, tick: Tick, message: impl AsRef<str>) {
        self.exec_log
            .push_back(format!("[{}] {}", tick, message.as_ref()));
        if self.exec_log.len() > EXEC_LOG_CAP {
            self.exec_log.pop_front();
        }
    }

    pub fn exec_log(&self) -> impl Iterator<Item = &str> {
        self.exec_log.iter().map(String::as_str)
    }

    pub fn exec_log_len(&self) -> usize {
        self.exec_log.len()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            current_instruction: self.current_instruction,
            total_instructions: self.total_instructions(),
            memory_size: self.memory_size,
            variables: self.variables(),
            exec_log: self.exec_log.iter().cloned().collect(),
        }
    }
}

/// Read-only copy of a PCB handed to the shell; the live PCB never leaves
/// the queue mutex.
#[derive(Clone)]
pub struct ProcessSnapshot {
    pub id: Pid,
    pub name: String,
    pub state: ProcessState,
    pub current_instruction: usize,
    pub total_instructions: usize,
    pub memory_size: u32,
    pub variables: Vec<(String, u16)>,
    pub exec_log: Vec<String>,
}

impl ProcessSnapshot {
    /// Most recent FAULT entry, shown for memory-violated processes.
    pub fn last_fault(&self) -> Option<&str> {
        self.exec_log
            .iter()
            .rev()
            .find(|e| e.contains("FAULT"))
            .map(String::as_str)
    }
}
