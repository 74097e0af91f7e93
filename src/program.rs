//! Textual description of test programs.
//!
//! ```text
//! # message passing
//! P0: write 0x100
//! P0: fence
//! P0: write 0x140 8
//! P1: read 0x140 8
//! P1: read 0x100
//! ```

use crate::codegen::assembler::INIT_PID;
use crate::codegen::x86_64::{Delay, Fence, MemKind, MemOperation, Return, MAX_DELAY};
use crate::codegen::OperationBox;
use crate::event::Pid;
use crate::util::parse_address;
use anyhow::Context;
use log::debug;
use regex::Regex;
use std::{fs, path::Path, str::FromStr};
use thiserror::Error;

//
// Public Interface
//

pub const DEFAULT_ACCESS_SIZE: usize = 1;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("line {line}: unrecognized statement '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: thread id {pid} is out of range")]
    InvalidPid { line: usize, pid: String },

    #[error("line {line}: {reason}")]
    InvalidAddress { line: usize, reason: String },

    #[error("line {line}: access size {size} is not one of 1, 2, 4 or 8")]
    InvalidSize { line: usize, size: String },

    #[error("line {line}: delay of {count} exceeds the maximum of {max}")]
    InvalidDelay { line: usize, count: String, max: usize },
}

/// Parses one operation per line into a flat list, preserving line order.
pub fn parse_program(text: &str) -> Result<Vec<OperationBox>, ProgramError> {
    let re_statement =
        Regex::new(r"^P([0-9]+):\s*([a-z-]+)(?:\s+(\S+))?(?:\s+(\S+))?$").unwrap();

    let mut ops = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let statement = raw.split('#').next().unwrap_or_default().trim();

        if statement.is_empty() {
            continue;
        }

        let syntax = || ProgramError::Syntax {
            line,
            text: statement.to_string(),
        };

        let caps = re_statement.captures(statement).ok_or_else(syntax)?;
        let pid = parse_pid(line, &caps[1])?;
        let mnemonic = &caps[2];
        let first = caps.get(3).map(|m| m.as_str());
        let second = caps.get(4).map(|m| m.as_str());

        let op: OperationBox = match (mnemonic, first, second) {
            ("fence", None, None) => Box::new(Fence::new(pid)),
            ("ret", None, None) => Box::new(Return::new(pid)),
            ("delay", Some(count), None) => Box::new(Delay::new(pid, parse_delay(line, count)?)),
            (_, Some(addr), size) => {
                let kind = MemKind::from_str(mnemonic).map_err(|_| syntax())?;
                let addr = parse_address(addr)
                    .map_err(|reason| ProgramError::InvalidAddress { line, reason })?;
                let size = size.map_or(Ok(DEFAULT_ACCESS_SIZE), |s| parse_size(line, s))?;
                Box::new(MemOperation::new(pid, kind, addr, size))
            }
            _ => return Err(syntax()),
        };

        debug!("line {}: {:?}", line, op);
        ops.push(op);
    }

    Ok(ops)
}

pub fn load_program(path: &Path) -> anyhow::Result<Vec<OperationBox>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read program {}", path.display()))?;

    parse_program(&text).with_context(|| format!("failed to parse program {}", path.display()))
}

//
// Private Implementation
//

fn parse_pid(line: usize, s: &str) -> Result<Pid, ProgramError> {
    match Pid::from_str(s) {
        Ok(pid) if pid != INIT_PID => Ok(pid),
        _ => Err(ProgramError::InvalidPid {
            line,
            pid: s.to_string(),
        }),
    }
}

fn parse_size(line: usize, s: &str) -> Result<usize, ProgramError> {
    match usize::from_str(s) {
        Ok(size @ (1 | 2 | 4 | 8)) => Ok(size),
        _ => Err(ProgramError::InvalidSize {
            line,
            size: s.to_string(),
        }),
    }
}

fn parse_delay(line: usize, s: &str) -> Result<usize, ProgramError> {
    match usize::from_str(s) {
        Ok(count) if count <= MAX_DELAY => Ok(count),
        _ => Err(ProgramError::InvalidDelay {
            line,
            count: s.to_string(),
            max: MAX_DELAY,
        }),
    }
}
