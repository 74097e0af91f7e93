//! Compile, execute and resolve test programs, one epoch at a time.

use crate::codegen::x86_64::MAX_OP_LEN;
use crate::codegen::{AssemblerOptions, BackendX86_64, Compiler, InstPtr, OpRef, Threads};
use crate::emulate::{Emulator, EmulatorError, Schedule, PAGE_SIZE};
use crate::event::{Addr, Pid};
use crate::witness::{ArchTso, ExecWitness};
use bytesize::ByteSize;
use log::{debug, info, warn};
use std::io::Write;
use thiserror::Error;

//
// Public Interface
//

pub mod defaults {
    use super::*;

    pub const CODE_BASE: InstPtr = 0x40_0000;
    pub const THREAD_STRIDE: u64 = 0x1_0000;
    pub const MEMORY_SIZE: ByteSize = ByteSize(bytesize::MIB);
    pub const SCHEDULE: Schedule = Schedule::RoundRobin;
    pub const MAX_STEPS: u64 = 1_000_000;
    pub const STRICT: bool = crate::codegen::assembler::defaults::STRICT;
}

#[derive(Clone, Debug)]
pub struct HarnessOptions {
    /// Address at which the code of thread 0 is placed
    pub code_base: InstPtr,
    /// Distance between the code of consecutive thread ids
    pub thread_stride: u64,
    /// The size of the shared data memory
    pub memory_size: ByteSize,
    /// Interleaving of the threads during execution
    pub schedule: Schedule,
    /// Upper bound of executed instructions per epoch, over all threads
    pub max_steps: u64,
    /// Fail on observations that resolve to no write of the epoch
    pub strict: bool,
}

impl Default for HarnessOptions {
    fn default() -> HarnessOptions {
        HarnessOptions {
            code_base: defaults::CODE_BASE,
            thread_stride: defaults::THREAD_STRIDE,
            memory_size: defaults::MEMORY_SIZE,
            schedule: defaults::SCHEDULE,
            max_steps: defaults::MAX_STEPS,
            strict: defaults::STRICT,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HarnessError {
    #[error("memory size {0} is not a multiple of the page size")]
    InvalidMemorySize(ByteSize),

    #[error("code of thread {pid} ({len} bytes) exceeds the thread stride of {stride:#x}")]
    CodeOverflow { pid: Pid, len: usize, stride: u64 },

    #[error("identifier space exhausted before operation {index} of thread {pid}")]
    Exhausted { pid: Pid, index: usize },

    #[error("observation at {ip:#x} of {addr:#x} could not be resolved")]
    Unresolved { ip: InstPtr, addr: Addr },

    #[error("execution failed: {0}")]
    Emulator(#[from] EmulatorError),
}

/// Outcome of one epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpochSummary {
    pub epoch: u64,
    pub steps: u64,
    pub observations: usize,
    pub unresolved: usize,
}

/// Emitted code of one thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadCode {
    pub pid: Pid,
    pub base: InstPtr,
    pub code: Vec<u8>,
}

#[derive(Debug)]
pub struct Harness {
    compiler: Compiler<BackendX86_64>,
    options: HarnessOptions,
    code: Vec<ThreadCode>,
    epoch: u64,
}

impl Harness {
    pub fn new(threads: Threads, options: &HarnessOptions) -> Result<Self, HarnessError> {
        if options.memory_size.as_u64() % PAGE_SIZE as u64 != 0 {
            return Err(HarnessError::InvalidMemorySize(options.memory_size));
        }

        let assembler_options = AssemblerOptions {
            strict: options.strict,
        };

        Ok(Self {
            compiler: Compiler::new(
                Box::new(ArchTso::default()),
                &assembler_options,
                Some(threads),
            ),
            options: options.clone(),
            code: Vec::new(),
            epoch: 0,
        })
    }

    pub fn compiler(&self) -> &Compiler<BackendX86_64> {
        &self.compiler
    }

    pub fn witness(&self) -> &ExecWitness {
        self.compiler.asms().witness()
    }

    /// Code of the last emission, by ascending thread id.
    pub fn code(&self) -> &[ThreadCode] {
        &self.code
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Starts a new epoch and emits every thread at its own base address.
    pub fn emit(&mut self) -> Result<(), HarnessError> {
        self.compiler.reset(None);
        self.code.clear();
        self.epoch += 1;

        let mut pids: Vec<Pid> = self.compiler.threads().keys().copied().collect();
        pids.sort_unstable();

        for pid in pids {
            let count = self.compiler.threads()[&pid].len();
            let base = self.options.code_base + pid as u64 * self.options.thread_stride;
            let mut code = vec![0; count * MAX_OP_LEN];

            let mut len = 0;
            let mut last_op = None;
            for index in 0..count {
                if self.compiler.asms().exhausted() {
                    return Err(HarnessError::Exhausted { pid, index });
                }
                len += self.compiler.emit_op(
                    base + len as InstPtr,
                    OpRef { pid, index },
                    &mut code[len..],
                    Some(&mut last_op),
                );
            }

            if len as u64 > self.options.thread_stride {
                return Err(HarnessError::CodeOverflow {
                    pid,
                    len,
                    stride: self.options.thread_stride,
                });
            }

            code.truncate(len);
            self.code.push(ThreadCode { pid, base, code });
        }

        debug!(
            "epoch {}: emitted {} threads, {} events",
            self.epoch,
            self.code.len(),
            self.witness().events.len()
        );
        Ok(())
    }

    /// Emits, executes and resolves all observations of one epoch.
    pub fn run_epoch(&mut self) -> Result<EpochSummary, HarnessError> {
        time_info!("epoch", {
            self.emit()?;

            let mut emulator = Emulator::new(self.options.memory_size);
            self.code
                .iter()
                .for_each(|thread| emulator.load(thread.pid, thread.base, &thread.code));

            let observations = time_debug!("execution", {
                emulator.run(self.options.schedule, self.options.max_steps)?
            });

            let mut summary = EpochSummary {
                epoch: self.epoch,
                steps: emulator.steps(),
                observations: observations.len(),
                unresolved: 0,
            };

            for observation in observations {
                let resolved = self.compiler.update_from(
                    observation.ip,
                    observation.part,
                    observation.addr,
                    &observation.value,
                );

                if !resolved {
                    warn!(
                        "thread {}: unresolved observation at {:#x} of {:#x}: {:02x?}",
                        observation.pid, observation.ip, observation.addr, observation.value
                    );
                    if self.options.strict {
                        return Err(HarnessError::Unresolved {
                            ip: observation.ip,
                            addr: observation.addr,
                        });
                    }
                    summary.unresolved += 1;
                }
            }

            info!(
                "epoch {}: {} steps, {} observations, {} rf, {} unresolved",
                summary.epoch,
                summary.steps,
                summary.observations,
                self.witness().rf.len(),
                summary.unresolved
            );

            Ok(summary)
        })
    }
}

/// Writes a hex listing of emitted code, 16 bytes per line.
pub fn write_code<W>(code: &[ThreadCode], mut out: W) -> anyhow::Result<()>
where
    W: Write,
{
    for thread in code {
        writeln!(
            out,
            "; thread {} at {:#x} ({} bytes)",
            thread.pid,
            thread.base,
            thread.code.len()
        )?;
        for (offset, chunk) in (0..).step_by(16).zip(thread.code.chunks(16)) {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            writeln!(out, "{:#010x}: {}", thread.base + offset, bytes.join(" "))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::threads_extract;
    use crate::program::parse_program;

    fn harness(text: &str, options: &HarnessOptions) -> Harness {
        let ops = parse_program(text).unwrap();
        Harness::new(threads_extract(&ops), options).unwrap()
    }

    #[test]
    fn threads_are_placed_by_stride() {
        let mut harness = harness(
            "P0: write 0x100\nP2: read 0x100\nP2: ret",
            &HarnessOptions::default(),
        );
        harness.emit().unwrap();

        let placement: Vec<(Pid, InstPtr, usize)> = harness
            .code()
            .iter()
            .map(|t| (t.pid, t.base, t.code.len()))
            .collect();
        assert_eq!(placement, vec![(0, 0x40_0000, 22), (2, 0x42_0000, 13)]);
    }

    #[test]
    fn sequential_run_resolves_reads() {
        let options = HarnessOptions {
            schedule: Schedule::Sequential,
            ..HarnessOptions::default()
        };
        let mut harness = harness("P0: write 0x100 2\nP1: read 0x100 2", &options);

        let summary = harness.run_epoch().unwrap();

        assert_eq!(summary.epoch, 1);
        assert_eq!(summary.observations, 1);
        assert_eq!(summary.unresolved, 0);
        assert_eq!(harness.witness().rf.len(), 2);
    }

    #[test]
    fn epochs_start_from_scratch() {
        let mut harness = harness("P0: write 0x100\nP0: read 0x100", &HarnessOptions::default());

        let first = harness.run_epoch().unwrap();
        let events = harness.witness().events.len();
        let second = harness.run_epoch().unwrap();

        assert_eq!(second.epoch, first.epoch + 1);
        assert_eq!(harness.witness().events.len(), events);
        assert_eq!(harness.witness().rf.len(), 1);
    }

    #[test]
    fn code_listing() {
        let code = vec![ThreadCode {
            pid: 1,
            base: 0x1000,
            code: (0..18).collect(),
        }];
        let mut out = Vec::new();
        write_code(&code, &mut out).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "; thread 1 at 0x1000 (18 bytes)\n\
             0x00001000: 00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n\
             0x00001010: 10 11\n"
        );
    }

    #[test]
    fn rejects_odd_memory_size() {
        let options = HarnessOptions {
            memory_size: ByteSize::b(1000),
            ..HarnessOptions::default()
        };
        let result = Harness::new(Threads::new(), &options);
        assert_eq!(
            result.err(),
            Some(HarnessError::InvalidMemorySize(ByteSize::b(1000)))
        );
    }

    #[test]
    fn code_must_fit_stride() {
        let options = HarnessOptions {
            thread_stride: 16,
            ..HarnessOptions::default()
        };
        let mut harness = harness("P0: write 0x100", &options);
        assert_eq!(
            harness.emit(),
            Err(HarnessError::CodeOverflow {
                pid: 0,
                len: 22,
                stride: 16
            })
        );
    }

    #[test]
    fn exhausted_identifiers_fail_emission() {
        let text: Vec<String> = (0..32)
            .map(|i| format!("P0: write {:#x} 8", 0x100 + i * 8))
            .collect();
        let mut harness = harness(&text.join("\n"), &HarnessOptions::default());

        // 31 stores of 8 bytes use up every write id.
        let expected = Some(HarnessError::Exhausted { pid: 0, index: 31 });
        assert_eq!(harness.emit().err(), expected);
        assert_eq!(harness.run_epoch().err(), expected);
    }

    #[test]
    fn data_outside_memory_fails() {
        let options = HarnessOptions {
            memory_size: ByteSize::kib(4),
            ..HarnessOptions::default()
        };
        let mut harness = harness("P0: read 0x2000", &options);
        assert!(matches!(
            harness.run_epoch(),
            Err(HarnessError::Emulator(EmulatorError::AccessOutOfRange { addr: 0x2000, .. }))
        ));
    }
}
