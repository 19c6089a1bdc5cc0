//! Synthetic process generator.
//!
//! While `scheduler-start` is active the scheduler loop asks the generator
//! once per tick; every `batch_process_freq` ticks it synthesizes one
//! process with a random instruction stream and hands it back for
//! admission to the ready queue.

use crate::config::Config;
use crate::kernel::clock::Tick;
use crate::kernel::process::{Instruction, Opcode, Pid, Process};
use crate::random::UniformRng;

/// Variables synthesized instructions draw from.
const VAR_POOL: [&str; 4] = ["x", "y", "z", "counter"];

/// 1 in N chance that a slot becomes a FOR header.
const FOR_PROBABILITY: u64 = 10;
const MIN_FOR_ITERATIONS: u64 = 2;
const MAX_FOR_ITERATIONS: u64 = 5;
const MIN_FOR_BODY: u64 = 2;
const MAX_FOR_BODY: u64 = 5;

/// Literal ranges are half-open: DECLARE draws from [0, 100), arithmetic
/// operands from [0, 50).
const MAX_DECLARE_VALUE: u64 = 100;
const MAX_ARITHMETIC_OPERAND: u64 = 50;
const MIN_SLEEP_TICKS: u64 = 1;
const MAX_SLEEP_TICKS: u64 = 10;

/// Address space that synthesized READ/WRITE instructions target.
const GENERATED_ADDRESS_SPACE: u64 = 4096;

/// Process ids below this are zero-padded (p01 .. p09).
const NAME_PAD_THRESHOLD: Pid = 10;

pub struct Generator {
    rng: UniformRng,
    last_generation_tick: Tick,
}

impl Generator {
    pub fn new() -> Generator {
        Generator::with_rng(UniformRng::from_entropy())
    }

    pub fn with_rng(rng: UniformRng) -> Generator {
        Generator {
            rng,
            last_generation_tick: 0,
        }
    }

    /// True when `batch_process_freq` ticks have elapsed since the last
    /// generation. Lets the caller reserve a pid only when one is needed.
    pub fn due(&self, tick: Tick, cfg: &Config) -> bool {
        tick - self.last_generation_tick >= cfg.batch_process_freq
    }

    /// Synthesize one process if generation is due.
    pub fn maybe_generate(&mut self, tick: Tick, cfg: &Config, pid: Pid) -> Option<Process> {
        if !self.due(tick, cfg) {
            return None;
        }
        self.last_generation_tick = tick;
        let name = process_name(pid);
        let mem_size = self.random_mem_size(cfg);
        Some(self.synthesize(pid, name, mem_size, cfg))
    }

    /// Build a process with a random instruction stream of length
    /// [min_ins, max_ins].
    pub fn synthesize(
        &mut self,
        pid: Pid,
        name: impl Into<String>,
        mem_size: u32,
        cfg: &Config,
    ) -> Process {
        let name = name.into();
        let count = self.rng.gen_range(cfg.min_ins as u64, cfg.max_ins as u64) as usize;
        let mut instructions = Vec::with_capacity(count);

        for slot in 0..count {
            let remaining = (count - slot - 1) as u64;
            if remaining >= MIN_FOR_BODY && self.rng.one_in(FOR_PROBABILITY) {
                let iterations = self.rng.gen_range(MIN_FOR_ITERATIONS, MAX_FOR_ITERATIONS);
                let body = self
                    .rng
                    .gen_range(MIN_FOR_BODY, remaining.min(MAX_FOR_BODY));
                instructions.push(Instruction {
                    op: Opcode::For,
                    args: vec![iterations.to_string(), body.to_string()],
                });
            } else {
                instructions.push(self.random_plain_instruction());
            }
        }

        log::debug!(
            "generated process {} ({} instructions, {} bytes)",
            name,
            count,
            mem_size
        );
        Process::new(pid, name, instructions, mem_size)
    }

    fn random_plain_instruction(&mut self) -> Instruction {
        match self.rng.gen_range(0, 6) {
            0 => Instruction::new(Opcode::Print, vec![]),
            1 => {
                let var = *self.rng.pick(&VAR_POOL);
                let value = self.rng.gen_range(0, MAX_DECLARE_VALUE - 1).to_string();
                Instruction::new(Opcode::Declare, vec![var, value.as_str()])
            }
            2 => self.random_arithmetic(Opcode::Add),
            3 => self.random_arithmetic(Opcode::Subtract),
            4 => {
                let ticks = self
                    .rng
                    .gen_range(MIN_SLEEP_TICKS, MAX_SLEEP_TICKS)
                    .to_string();
                Instruction::new(Opcode::Sleep, vec![ticks.as_str()])
            }
            5 => {
                let var = *self.rng.pick(&VAR_POOL);
                let addr = self.random_hex_address();
                Instruction::new(Opcode::Read, vec![var, addr.as_str()])
            }
            _ => {
                let addr = self.random_hex_address();
                let value = self.random_operand(MAX_DECLARE_VALUE);
                Instruction::new(Opcode::Write, vec![addr.as_str(), value.as_str()])
            }
        }
    }

    fn random_arithmetic(&mut self, op: Opcode) -> Instruction {
        let dst = *self.rng.pick(&VAR_POOL);
        let a = self.random_operand(MAX_ARITHMETIC_OPERAND);
        let b = self.random_operand(MAX_ARITHMETIC_OPERAND);
        Instruction::new(op, vec![dst, a.as_str(), b.as_str()])
    }

    /// 50% literal, 50% pool variable.
    fn random_operand(&mut self, max_literal: u64) -> String {
        if self.rng.one_in(2) {
            self.rng.gen_range(0, max_literal - 1).to_string()
        } else {
            self.rng.pick(&VAR_POOL).to_string()
        }
    }

    fn random_hex_address(&mut self) -> String {
        format!("0x{:X}", self.rng.gen_range(0, GENERATED_ADDRESS_SPACE - 1))
    }

    /// Uniformly chosen power of two within the configured per-process
    /// memory bounds.
    fn random_mem_size(&mut self, cfg: &Config) -> u32 {
        let lo = cfg.min_mem_per_proc.next_power_of_two();
        let hi = cfg.max_mem_per_proc;
        if lo >= hi {
            return lo.min(hi.next_power_of_two());
        }
        let lo_exp = lo.trailing_zeros() as u64;
        let hi_exp = (31 - hi.leading_zeros()) as u64;
        1u32 << self.rng.gen_range(lo_exp, hi_exp)
    }
}

impl Default for Generator {
    fn default() -> Generator {
        Generator::new()
    }
}

/// `p01`, `p02`, ... `p09`, `p10`, `p11`, ...
pub fn process_name(pid: Pid) -> String {
    if pid < NAME_PAD_THRESHOLD {
        format!("p0{}", pid)
    } else {
        format!("p{}", pid)
    }
}
