//! Pattern sequencer: a bounded micro-program engine.
//!
//! Instruction memory holds timed [`PatternWord`]s loaded one per write
//! with an auto-incrementing address. While RUN is asserted the program
//! counter advances once per pattern-clock tick; the pattern clock is the
//! system clock divided by [`SYS_CLKS_PER_PTN_CLK`]. A stored BRANCH word
//! redirects the program counter instead of emitting device data, and the
//! all-zero word is the END sentinel.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::opcodes::NUM_CHANNELS;
use crate::status::ErrorCode;

/// Bounded instruction memory size, in words.
pub const PTN_RAM_WORDS: usize = 4096;

/// Pattern clock divisor: one pattern tick per this many system clocks.
/// A hardware compile-time constant, exposed here as configuration.
pub const SYS_CLKS_PER_PTN_CLK: u32 = 10;

/// Words zeroed per system tick while a CLEAR is in progress.
pub const CLEAR_WORDS_PER_TICK: usize = 256;

/// Reserved override index meaning "override off".
pub const PTN_OVERRIDE_OFF: u16 = 0xFFFF;

/// Stored-opcode value marking an unconditional branch word.
pub const BRANCH_OPCODE: u8 = 0x23;

/// Status bit reported while the sequencer is clearing RAM.
pub const PTN_CLEAR_MODE: u8 = 0x40;

/// Status bit reported while the sequencer is running.
pub const PTN_RUN_MODE: u8 = 0x01;

/// Wire size of a pattern write word: 24-bit tick, 8-bit opcode, 64-bit
/// data.
pub const PATTERN_WR_BYTES: usize = 12;

/// Wire size of a read-back word: the tick field is omitted.
pub const PATTERN_RD_BYTES: usize = 9;

/// One timed instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatternWord {
    /// Pattern-clock tick at which this word becomes eligible to execute.
    pub tick: u32,
    /// Interpreted by the target device, except [`BRANCH_OPCODE`].
    pub opcode: u8,
    pub data: [u8; 8],
}

impl PatternWord {
    pub const NONE: PatternWord = PatternWord {
        tick: 0,
        opcode: 0,
        data: [0; 8],
    };

    /// The all-zero word is the END sentinel.
    pub fn is_end(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_branch(&self) -> bool {
        self.opcode == BRANCH_OPCODE
    }

    pub fn branch(target: u16) -> Self {
        let mut data = [0u8; 8];
        data[..2].copy_from_slice(&target.to_le_bytes());
        PatternWord {
            tick: 0,
            opcode: BRANCH_OPCODE,
            data,
        }
    }

    pub fn branch_target(&self) -> u16 {
        u16::from_le_bytes([self.data[0], self.data[1]])
    }

    /// Decode the 96-bit write-word wire form.
    pub fn from_write_bytes(bytes: &[u8; PATTERN_WR_BYTES]) -> Self {
        let tick = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[4..12]);
        PatternWord {
            tick,
            opcode: bytes[3],
            data,
        }
    }

    pub fn to_write_bytes(&self) -> [u8; PATTERN_WR_BYTES] {
        let mut out = [0u8; PATTERN_WR_BYTES];
        out[..3].copy_from_slice(&self.tick.to_le_bytes()[..3]);
        out[3] = self.opcode;
        out[4..12].copy_from_slice(&self.data);
        out
    }

    /// 72-bit read-back form: opcode + data, tick omitted.
    pub fn to_read_bytes(&self) -> [u8; PATTERN_RD_BYTES] {
        let mut out = [0u8; PATTERN_RD_BYTES];
        out[0] = self.opcode;
        out[1..9].copy_from_slice(&self.data);
        out
    }
}

/// Outcome of one system-clock tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequencerTick {
    /// Word emitted toward the device bus this tick, if any.
    pub emitted: Option<PatternWord>,
    /// The program halted this tick (END, end of memory, or error).
    pub stopped: bool,
    /// Execution fault recorded this tick.
    pub error: Option<ErrorCode>,
    /// A RAM clear finished this tick.
    pub clear_done: bool,
}

#[derive(Debug)]
pub struct PatternSequencer {
    ram: Box<[PatternWord]>,
    load_addr: u16,
    start_addr: u16,
    pc: u16,
    running: bool,
    ptn_tick: u32,
    clk_accum: u32,
    /// Next word to zero and the exclusive end of the clear region.
    clearing: Option<(usize, usize)>,
    override_idx: [u16; NUM_CHANNELS as usize],
}

impl PatternSequencer {
    pub fn new() -> Self {
        PatternSequencer {
            ram: vec![PatternWord::NONE; PTN_RAM_WORDS].into_boxed_slice(),
            load_addr: 0,
            start_addr: 0,
            pc: 0,
            running: false,
            ptn_tick: 0,
            clk_accum: 0,
            clearing: None,
            override_idx: [PTN_OVERRIDE_OFF; NUM_CHANNELS as usize],
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_clearing(&self) -> bool {
        self.clearing.is_some()
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn ptn_tick(&self) -> u32 {
        self.ptn_tick
    }

    /// RUN | CLEAR status bits for the response payload.
    pub fn mode_bits(&self) -> u8 {
        let mut bits = 0;
        if self.running {
            bits |= PTN_RUN_MODE;
        }
        if self.is_clearing() {
            bits |= PTN_CLEAR_MODE;
        }
        bits
    }

    pub fn read_word(&self, addr: u16) -> Option<PatternWord> {
        self.ram.get(addr as usize).copied()
    }

    /// PATADR: set the load/start address.
    pub fn set_address(&mut self, addr: u16) -> Result<(), ErrorCode> {
        if self.running {
            return Err(ErrorCode::PatternRunning);
        }
        if addr as usize >= PTN_RAM_WORDS {
            return Err(ErrorCode::PatternAddr);
        }
        self.load_addr = addr;
        self.start_addr = addr;
        Ok(())
    }

    /// LOAD one word at the current address, auto-incrementing.
    pub fn write_word(&mut self, word: PatternWord) -> Result<(), ErrorCode> {
        if self.running {
            // Writes while RUN is asserted are rejected; one past the
            // writable bound is the overrun case.
            if self.load_addr as usize >= PTN_RAM_WORDS {
                return Err(ErrorCode::PatternOverrun);
            }
            return Err(ErrorCode::PatternRunning);
        }
        if self.is_clearing() {
            return Err(ErrorCode::PatternState);
        }
        if self.load_addr as usize >= PTN_RAM_WORDS {
            return Err(ErrorCode::WrPtnRam);
        }
        self.ram[self.load_addr as usize] = word;
        self.load_addr += 1;
        Ok(())
    }

    /// BRANCH: store an unconditional branch word at the load address.
    pub fn write_branch(&mut self, target: u16) -> Result<(), ErrorCode> {
        if target as usize >= PTN_RAM_WORDS {
            return Err(ErrorCode::PatternAddr);
        }
        self.write_word(PatternWord::branch(target))
    }

    /// OVRD: select a non-default start index for `channel`, or
    /// [`PTN_OVERRIDE_OFF`] to fall back to the PATADR start.
    pub fn set_override(&mut self, channel: u8, index: u16) -> Result<(), ErrorCode> {
        if channel >= NUM_CHANNELS {
            return Err(ErrorCode::PatternState);
        }
        if index != PTN_OVERRIDE_OFF && index as usize >= PTN_RAM_WORDS {
            return Err(ErrorCode::PatternAddr);
        }
        self.override_idx[channel as usize] = index;
        Ok(())
    }

    pub fn override_index(&self, channel: u8) -> Option<u16> {
        let idx = *self.override_idx.get(channel as usize)?;
        (idx != PTN_OVERRIDE_OFF).then_some(idx)
    }

    /// Program start: lowest-channel override wins, PATADR start otherwise.
    fn effective_start(&self) -> u16 {
        self.override_idx
            .iter()
            .copied()
            .find(|&idx| idx != PTN_OVERRIDE_OFF)
            .unwrap_or(self.start_addr)
    }

    /// RUN: start execution at the effective start address.
    pub fn run(&mut self) -> Result<(), ErrorCode> {
        if self.running {
            return Err(ErrorCode::PatternRunning);
        }
        if self.is_clearing() {
            return Err(ErrorCode::PatternState);
        }
        self.pc = self.effective_start();
        self.ptn_tick = 0;
        self.clk_accum = 0;
        self.running = true;
        info!(pc = self.pc, "pattern run");
        Ok(())
    }

    /// STOP: halt at the current program counter. Idempotent.
    pub fn stop(&mut self) {
        if self.running {
            debug!(pc = self.pc, "pattern stop");
        }
        self.running = false;
    }

    /// ABORT: the one asynchronous preemption primitive. Halts within the
    /// current tick.
    pub fn abort(&mut self) -> bool {
        let was_running = self.running;
        self.running = false;
        if was_running {
            info!(pc = self.pc, "pattern abort");
        }
        was_running
    }

    /// STEP: execute exactly one instruction regardless of RUN, ignoring
    /// the word's tick gate.
    pub fn step(&mut self) -> Result<Option<PatternWord>, ErrorCode> {
        if self.is_clearing() {
            return Err(ErrorCode::PatternState);
        }
        let mut tick = SequencerTick::default();
        self.execute_one(&mut tick, true);
        match tick.error {
            Some(err) => Err(err),
            None => Ok(tick.emitted),
        }
    }

    /// CLEAR: begin a chunked wipe of the whole instruction memory. The
    /// clear status bit stays up until the wipe completes.
    pub fn clear(&mut self) -> Result<(), ErrorCode> {
        if self.running {
            return Err(ErrorCode::PatternRunning);
        }
        self.clearing = Some((0, PTN_RAM_WORDS));
        self.load_addr = 0;
        self.start_addr = 0;
        self.pc = 0;
        self.ptn_tick = 0;
        info!("pattern clear started");
        Ok(())
    }

    /// RESET path: halt, wipe, and drop overrides immediately.
    pub fn hard_reset(&mut self) {
        self.running = false;
        self.clearing = None;
        self.ram.fill(PatternWord::NONE);
        self.load_addr = 0;
        self.start_addr = 0;
        self.pc = 0;
        self.ptn_tick = 0;
        self.clk_accum = 0;
        self.override_idx = [PTN_OVERRIDE_OFF; NUM_CHANNELS as usize];
    }

    /// Advance one system clock. Pattern execution happens every
    /// [`SYS_CLKS_PER_PTN_CLK`] calls; RAM clearing proceeds every call.
    pub fn tick_system_clock(&mut self) -> SequencerTick {
        let mut tick = SequencerTick::default();

        if let Some((next, end)) = self.clearing {
            let stop = (next + CLEAR_WORDS_PER_TICK).min(end);
            self.ram[next..stop].fill(PatternWord::NONE);
            if stop >= end {
                self.clearing = None;
                tick.clear_done = true;
                info!("pattern clear complete");
            } else {
                self.clearing = Some((stop, end));
            }
        }

        self.clk_accum += 1;
        if self.clk_accum >= SYS_CLKS_PER_PTN_CLK {
            self.clk_accum = 0;
            if self.running {
                self.execute_one(&mut tick, false);
                self.ptn_tick += 1;
            }
        }
        tick
    }

    fn execute_one(&mut self, tick: &mut SequencerTick, force: bool) {
        if self.pc as usize >= PTN_RAM_WORDS {
            // Fell off the end of memory
            self.running = false;
            tick.stopped = true;
            tick.error = Some(ErrorCode::PatternAddr);
            return;
        }
        let word = self.ram[self.pc as usize];
        if word.is_end() {
            self.running = false;
            tick.stopped = true;
            debug!(pc = self.pc, "pattern end sentinel");
            return;
        }
        if !force && word.tick > self.ptn_tick {
            // Not yet due; hold the program counter
            return;
        }
        if word.is_branch() {
            let target = word.branch_target();
            if target as usize >= PTN_RAM_WORDS {
                self.running = false;
                tick.stopped = true;
                tick.error = Some(ErrorCode::PatternAddr);
                return;
            }
            self.pc = target;
            return;
        }
        tick.emitted = Some(word);
        self.pc += 1;
    }
}

impl Default for PatternSequencer {
    fn default() -> Self {
        Self::new()
    }
}
