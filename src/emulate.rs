//! Sequential execution of generated test code.
//!
//! Stands in for real hardware: it understands exactly the instructions the
//! x86-64 operations emit and interleaves the threads according to a
//! [`Schedule`]. Every load and exchange is reported as an [`Observation`],
//! which is what a hardware driver would collect from a real run.

use crate::codegen::x86_64::{
    MFENCE, MOV_LOAD, MOV_LOAD_8, MOV_R64_IMM64, MOV_STORE, MOV_STORE_8, NOP, OPERAND_SIZE_16, RET,
    REX_W, XCHG, XCHG_8,
};
use crate::codegen::{InstPtr, WriteId};
use crate::event::{Addr, Pid};
use crate::memory::VirtualMemory;
use byteorder::{ByteOrder, LittleEndian};
use bytesize::ByteSize;
use log::{debug, trace};
use strum::{EnumString, EnumVariantNames, IntoStaticStr};
use thiserror::Error;

//
// Public Interface
//

pub type EmulatorValue = u64;

pub const PAGE_SIZE: usize = 4 * 1024;
pub const NUMBER_OF_REGISTERS: usize = 8;

/// Order in which threads get to execute instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, EnumVariantNames, IntoStaticStr)]
#[strum(serialize_all = "kebab_case")]
pub enum Schedule {
    /// One instruction per thread in turn, by ascending thread id.
    RoundRobin,
    /// Each thread runs to completion before the next one starts.
    Sequential,
}

/// A value read from memory by one instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub pid: Pid,
    pub ip: InstPtr,
    pub part: usize,
    pub addr: Addr,
    pub value: Vec<WriteId>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EmulatorError {
    #[error("failed to decode instruction at {ip:#x} of thread {pid}")]
    InvalidInstruction { pid: Pid, ip: InstPtr },

    #[error("access of {size} bytes at {addr:#x} by instruction at {ip:#x} is out of range")]
    AccessOutOfRange { ip: InstPtr, addr: Addr, size: usize },

    #[error("has reached the maximum of {0} steps")]
    StepLimitReached(u64),
}

#[derive(Debug)]
pub struct Emulator {
    memory: VirtualMemory<u8>,
    harts: Vec<Hart>,
    observations: Vec<Observation>,
    steps: u64,
}

impl Emulator {
    pub fn new(memory_size: ByteSize) -> Self {
        Self {
            memory: VirtualMemory::new(memory_size.as_u64() as usize, PAGE_SIZE),
            harts: Vec::new(),
            observations: Vec::new(),
            steps: 0,
        }
    }

    /// Adds thread `pid` executing `code` placed at `base`.
    pub fn load(&mut self, pid: Pid, base: InstPtr, code: &[u8]) {
        assert!(
            self.harts.iter().all(|hart| hart.pid != pid),
            "thread {} loaded twice",
            pid
        );
        debug!("thread {}: {} bytes of code at {:#x}", pid, code.len(), base);
        self.harts.push(Hart {
            pid,
            base,
            code: code.to_vec(),
            pc: base,
            registers: [0; NUMBER_OF_REGISTERS],
            running: true,
        });
        self.harts.sort_by_key(|hart| hart.pid);
    }

    pub fn memory(&self) -> &VirtualMemory<u8> {
        &self.memory
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Executes all loaded threads until they return or run off their code.
    pub fn run(
        &mut self,
        schedule: Schedule,
        max_steps: u64,
    ) -> Result<Vec<Observation>, EmulatorError> {
        debug!(
            "running {} threads ({})",
            self.harts.len(),
            <&str>::from(schedule)
        );

        match schedule {
            Schedule::RoundRobin => {
                while self.harts.iter().any(|hart| hart.running) {
                    for index in 0..self.harts.len() {
                        if self.harts[index].running {
                            self.step(index, max_steps)?;
                        }
                    }
                }
            }
            Schedule::Sequential => {
                for index in 0..self.harts.len() {
                    while self.harts[index].running {
                        self.step(index, max_steps)?;
                    }
                }
            }
        }

        debug!(
            "finished after {} steps with {} observations",
            self.steps,
            self.observations.len()
        );
        Ok(std::mem::take(&mut self.observations))
    }
}

//
// Private Implementation
//

const REG_RAX: usize = 0;

#[derive(Debug)]
struct Hart {
    pid: Pid,
    base: InstPtr,
    code: Vec<u8>,
    pc: InstPtr,
    registers: [EmulatorValue; NUMBER_OF_REGISTERS],
    running: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Instruction {
    MovImm { reg: usize, imm: u64 },
    Store { size: usize, reg: usize },
    Load { size: usize, reg: usize },
    Exchange { size: usize, reg: usize },
    Fence,
    Nop,
    Ret,
}

fn decode(code: &[u8]) -> Option<(Instruction, usize)> {
    let mut pos = 0;
    let mut size = 4;
    let mut prefixed = false;

    match code.first()? {
        &OPERAND_SIZE_16 => {
            size = 2;
            pos += 1;
            prefixed = true;
        }
        &REX_W => {
            size = 8;
            pos += 1;
            prefixed = true;
        }
        _ => {}
    }

    let opcode = *code.get(pos)?;
    pos += 1;

    if size == 8 && (MOV_R64_IMM64..MOV_R64_IMM64 + 8).contains(&opcode) {
        let imm = code.get(pos..pos + 8)?;
        let reg = (opcode - MOV_R64_IMM64) as usize;
        return Some((
            Instruction::MovImm {
                reg,
                imm: LittleEndian::read_u64(imm),
            },
            pos + 8,
        ));
    }

    let memory_operand = |size: usize| -> Option<(usize, usize)> {
        let modrm = *code.get(pos)?;
        // Only `[rax]` addressing is ever emitted.
        if modrm & 0xc7 != 0 {
            return None;
        }
        Some((size, ((modrm >> 3) & 0x7) as usize))
    };

    let instruction = match opcode {
        MOV_STORE_8 | MOV_LOAD_8 | XCHG_8 if prefixed => return None,
        MOV_STORE_8 => memory_operand(1).map(|(size, reg)| Instruction::Store { size, reg })?,
        MOV_STORE => memory_operand(size).map(|(size, reg)| Instruction::Store { size, reg })?,
        MOV_LOAD_8 => memory_operand(1).map(|(size, reg)| Instruction::Load { size, reg })?,
        MOV_LOAD => memory_operand(size).map(|(size, reg)| Instruction::Load { size, reg })?,
        XCHG_8 => memory_operand(1).map(|(size, reg)| Instruction::Exchange { size, reg })?,
        XCHG => memory_operand(size).map(|(size, reg)| Instruction::Exchange { size, reg })?,
        _ if prefixed => return None,
        0x0f if code.get(pos - 1..pos + 2)? == MFENCE => return Some((Instruction::Fence, pos + 2)),
        NOP => return Some((Instruction::Nop, pos)),
        RET => return Some((Instruction::Ret, pos)),
        _ => return None,
    };

    Some((instruction, pos + 1))
}

impl Emulator {
    fn step(&mut self, index: usize, max_steps: u64) -> Result<(), EmulatorError> {
        if self.steps >= max_steps {
            return Err(EmulatorError::StepLimitReached(max_steps));
        }
        self.steps += 1;

        let (pid, ip, offset) = {
            let hart = &self.harts[index];
            (hart.pid, hart.pc, (hart.pc - hart.base) as usize)
        };

        if offset >= self.harts[index].code.len() {
            trace!("thread {} ran off its code at {:#x}", pid, ip);
            self.harts[index].running = false;
            return Ok(());
        }

        let (instruction, len) = decode(&self.harts[index].code[offset..])
            .ok_or(EmulatorError::InvalidInstruction { pid, ip })?;
        trace!("thread {} at {:#x}: {:?}", pid, ip, instruction);

        match instruction {
            Instruction::MovImm { reg, imm } => self.harts[index].registers[reg] = imm,
            Instruction::Store { size, reg } => {
                let addr = self.harts[index].registers[REG_RAX];
                let value = self.harts[index].registers[reg];
                self.write_bytes(ip, addr, size, value)?;
            }
            Instruction::Load { size, reg } => {
                let addr = self.harts[index].registers[REG_RAX];
                let bytes = self.read_bytes(ip, addr, size)?;
                let old = self.harts[index].registers[reg];
                self.harts[index].registers[reg] = merge_register(old, &bytes);
                self.observe(pid, ip, addr, bytes);
            }
            Instruction::Exchange { size, reg } => {
                let addr = self.harts[index].registers[REG_RAX];
                let bytes = self.read_bytes(ip, addr, size)?;
                let value = self.harts[index].registers[reg];
                self.write_bytes(ip, addr, size, value)?;
                self.harts[index].registers[reg] = merge_register(value, &bytes);
                self.observe(pid, ip, addr, bytes);
            }
            Instruction::Fence | Instruction::Nop => {}
            Instruction::Ret => {
                self.harts[index].running = false;
                return Ok(());
            }
        }

        self.harts[index].pc = ip + len as InstPtr;
        Ok(())
    }

    fn check_range(&self, ip: InstPtr, addr: Addr, size: usize) -> Result<usize, EmulatorError> {
        usize::try_from(addr)
            .ok()
            .filter(|&index| self.memory.contains(index, size))
            .ok_or(EmulatorError::AccessOutOfRange { ip, addr, size })
    }

    fn read_bytes(&self, ip: InstPtr, addr: Addr, size: usize) -> Result<Vec<u8>, EmulatorError> {
        let index = self.check_range(ip, addr, size)?;
        Ok((index..index + size).map(|i| self.memory[i]).collect())
    }

    fn write_bytes(
        &mut self,
        ip: InstPtr,
        addr: Addr,
        size: usize,
        value: EmulatorValue,
    ) -> Result<(), EmulatorError> {
        let index = self.check_range(ip, addr, size)?;
        value
            .to_le_bytes()
            .iter()
            .take(size)
            .enumerate()
            .for_each(|(i, b)| self.memory[index + i] = *b);
        Ok(())
    }

    fn observe(&mut self, pid: Pid, ip: InstPtr, addr: Addr, value: Vec<u8>) {
        self.observations.push(Observation {
            pid,
            ip,
            part: 0,
            addr,
            value,
        });
    }
}

// 32-bit destinations clear the upper half, narrower ones keep it.
fn merge_register(old: EmulatorValue, bytes: &[u8]) -> EmulatorValue {
    let mut result = if bytes.len() == 4 { [0; 8] } else { old.to_le_bytes() };
    result[..bytes.len()].copy_from_slice(bytes);
    EmulatorValue::from_le_bytes(result)
}
