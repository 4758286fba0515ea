pub mod cartridge;
pub mod config;
pub mod mapper;
mod palette;
pub mod ppu;
pub mod snapshot;
pub mod trace;
pub mod video;

use anyhow::{Result, bail};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut, RangeInclusive};
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

use cartridge::Cartridge;
use config::NesConfig;
use mapper::{Mapper, MapperObserver, MirrorMode, create_mapper, mapper_name};
use ppu::{Ppu, PpuDebugCounters, PpuHost};
use snapshot::{SectionKind, SnapshotError, SnapshotReader, SnapshotWriter};
use trace::{TraceEntry, TraceLog};
use video::FrameBuffer;

const OAM_DMA_CYCLES: u32 = 513;
const FRAME_GUARD_CPU_CYCLES: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("CPU port does not support {0}")]
    Unsupported(&'static str),
}

pub trait CpuPort {
    fn raise_nmi(&mut self);
    fn raise_irq(&mut self);
    fn cancel_irq(&mut self);
    fn stall(&mut self, _cycles: u32) -> Result<(), HostError> {
        Err(HostError::Unsupported("stall"))
    }
}

#[derive(Debug, Default)]
pub struct DetachedPort {
    stalled_cycles: u64,
}

impl DetachedPort {
    pub fn stalled_cycles(&self) -> u64 {
        self.stalled_cycles
    }
}

impl CpuPort for DetachedPort {
    fn raise_nmi(&mut self) {}

    fn raise_irq(&mut self) {}

    fn cancel_irq(&mut self) {}

    fn stall(&mut self, cycles: u32) -> Result<(), HostError> {
        self.stalled_cycles += cycles as u64;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CartridgeSignal {
    BankSwitched(RangeInclusive<u16>),
    IrqTriggered,
    IrqCancelled,
}

#[derive(Debug, Default)]
struct CartridgeSignals {
    queue: RefCell<Vec<CartridgeSignal>>,
}

impl CartridgeSignals {
    fn take(&self) -> Vec<CartridgeSignal> {
        std::mem::take(&mut *self.queue.borrow_mut())
    }
}

impl MapperObserver for CartridgeSignals {
    fn program_bank_switched(&self, range: RangeInclusive<u16>) {
        self.queue
            .borrow_mut()
            .push(CartridgeSignal::BankSwitched(range));
    }

    fn irq_triggered(&self) {
        self.queue.borrow_mut().push(CartridgeSignal::IrqTriggered);
    }

    fn irq_cancelled(&self) {
        self.queue.borrow_mut().push(CartridgeSignal::IrqCancelled);
    }
}

struct PpuBus<'a> {
    mapper: Option<&'a mut (dyn Mapper + 'static)>,
    video: &'a mut FrameBuffer,
    nmi: &'a mut bool,
}

impl PpuHost for PpuBus<'_> {
    fn read_pattern(&mut self, addr: u16) -> u8 {
        match self.mapper.as_mut() {
            Some(mapper) => mapper.ppu_read(addr),
            None => 0,
        }
    }

    fn write_pattern(&mut self, addr: u16, value: u8) {
        if let Some(mapper) = self.mapper.as_mut() {
            mapper.ppu_write(addr, value);
        }
    }

    fn mirror_mode(&self) -> MirrorMode {
        self.mapper
            .as_ref()
            .map_or(MirrorMode::Horizontal, |mapper| mapper.mirror_mode())
    }

    fn write_pixel(&mut self, x: u8, y: u8, _palette_index: u8, color: u8) {
        self.video.put_pixel(x, y, color);
    }

    fn present_frame(&mut self) {
        self.video.present();
    }

    fn raise_nmi(&mut self) {
        *self.nmi = true;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub cpu_cycles: u64,
    pub cpu_reads: u64,
    pub cpu_writes: u64,
    pub cpu_reads_ram: u64,
    pub cpu_reads_ppu_regs: u64,
    pub cpu_reads_cart: u64,
    pub cpu_writes_ram: u64,
    pub cpu_writes_ppu_regs: u64,
    pub cpu_writes_cart: u64,
    pub ppu_cycles: u64,
    pub dma_transfers: u64,
    pub dma_stall_cycles: u64,
    pub nmi_raised: u64,
    pub irq_raised: u64,
    pub irq_cancelled: u64,
    pub bank_switches: u64,
    pub last_cpu_read_addr: u16,
    pub last_cpu_write_addr: u16,
    pub last_cpu_write_value: u8,
}

pub struct Nes {
    config: NesConfig,
    ram: [u8; 2048],
    ppu: Ppu,
    mapper: Option<Box<dyn Mapper>>,
    mapper_name: String,
    signals: Rc<CartridgeSignals>,
    video: FrameBuffer,
    port: Box<dyn CpuPort>,
    trace: TraceLog,

    ppu_nmi: bool,
    pending_nmi: bool,
    pending_irq: bool,
    cpu_open_bus: u8,
    dma_cycles: u32,
    total_cycles: u64,
    paused: bool,
    last_host_error: Option<HostError>,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new(NesConfig::default())
    }
}

impl Nes {
    pub fn new(config: NesConfig) -> Self {
        Self::with_port(config, Box::new(DetachedPort::default()))
    }

    pub fn with_port(config: NesConfig, port: Box<dyn CpuPort>) -> Self {
        Self {
            ram: [0; 2048],
            ppu: Ppu::new(&config.ppu),
            mapper: None,
            mapper_name: "No cartridge".to_string(),
            signals: Rc::new(CartridgeSignals::default()),
            video: FrameBuffer::new(),
            port,
            trace: TraceLog::new(config.trace_capacity),
            ppu_nmi: false,
            pending_nmi: false,
            pending_irq: false,
            cpu_open_bus: 0,
            dma_cycles: 0,
            total_cycles: 0,
            paused: false,
            last_host_error: None,
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(config.debug_event_capacity.min(512)),
            config,
        }
    }

    pub fn set_cpu_port(&mut self, port: Box<dyn CpuPort>) {
        self.port = port;
    }

    pub fn config(&self) -> &NesConfig {
        &self.config
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn has_cartridge(&self) -> bool {
        self.mapper.is_some()
    }

    pub fn mapper(&self) -> Option<&dyn Mapper> {
        self.mapper.as_deref()
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn frame_buffer(&self) -> &FrameBuffer {
        &self.video
    }

    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn last_host_error(&self) -> Option<&HostError> {
        self.last_host_error.as_ref()
    }

    pub fn take_dma_cycles(&mut self) -> u32 {
        std::mem::take(&mut self.dma_cycles)
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.pending_nmi)
    }

    pub fn irq_line(&self) -> bool {
        self.pending_irq
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.debug
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.ppu.debug_counters()
    }

    pub fn debug_ppu_scanline_cycle(&self) -> (u16, u16) {
        (self.ppu.scanline(), self.ppu.cycle())
    }

    pub fn debug_peek_internal_ram(&self, addr: u16) -> u8 {
        self.ram[(addr as usize) & 0x07FF]
    }

    pub fn debug_peek_chr(&self, addr: u16) -> u8 {
        self.mapper
            .as_ref()
            .map_or(0, |mapper| mapper.debug_peek_chr(addr & 0x1FFF))
    }

    pub fn debug_mapper_state(&self) -> String {
        if let Some(mapper) = self.mapper.as_ref() {
            let state = mapper.debug_state();
            if state.is_empty() {
                self.mapper_name.clone()
            } else {
                state
            }
        } else {
            "No mapper".to_string()
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }

        self.debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        let event = event.into();
        log::debug!("{event}");
        if self.config.debug_event_capacity == 0 {
            return;
        }
        if self.debug_events.len() >= self.config.debug_event_capacity {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event);
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        let cart = Cartridge::from_file(path)?;
        self.insert_cartridge(cart)
    }

    pub fn insert_cartridge(&mut self, cart: Cartridge) -> Result<()> {
        let mapper_id = cart.mapper_id;
        let submapper_id = cart.submapper_id;
        let observer: Rc<dyn MapperObserver> = self.signals.clone();
        self.mapper = Some(create_mapper(cart, observer)?);
        let supported_name = mapper_name(mapper_id);
        self.mapper_name = if submapper_id != 0 {
            format!("{supported_name} (mapper {mapper_id}, submapper {submapper_id})")
        } else {
            format!("{supported_name} (mapper {mapper_id})")
        };
        self.trace.clear();
        self.reset();
        self.push_debug_event(format!("Cartridge inserted: {}", self.mapper_name));
        Ok(())
    }

    pub fn reset(&mut self) {
        self.ppu_nmi = false;
        self.pending_nmi = false;
        self.pending_irq = false;
        self.cpu_open_bus = 0;
        self.dma_cycles = 0;
        self.total_cycles = 0;
        self.last_host_error = None;
        self.debug = NesDebugCounters::default();
        self.debug_events.clear();
        self.signals.take();

        let mut bus = PpuBus {
            mapper: self.mapper.as_deref_mut(),
            video: &mut self.video,
            nmi: &mut self.ppu_nmi,
        };
        self.ppu.reset(&mut bus);
        self.ppu_nmi = false;
        self.push_debug_event("Console reset");
    }

    pub fn pause(&mut self) -> PauseGuard<'_> {
        let was_paused = std::mem::replace(&mut self.paused, true);
        PauseGuard {
            nes: self,
            was_paused,
        }
    }

    pub fn run_frame(&mut self) {
        if self.mapper.is_none() || self.paused {
            return;
        }

        self.video.take_frame_ready();
        let mut guard: u32 = 0;
        while !self.video.take_frame_ready() {
            self.tick_cpu_cycle();
            guard += 1;
            if guard > FRAME_GUARD_CPU_CYCLES {
                self.push_debug_event("Frame guard tripped at 1,000,000 CPU cycles");
                break;
            }
        }
        self.debug.frame_count = self.debug.frame_count.wrapping_add(1);
    }

    pub fn tick_cpu_cycle(&mut self) {
        if self.paused {
            return;
        }

        for _ in 0..3 {
            self.debug.ppu_cycles = self.debug.ppu_cycles.wrapping_add(1);
            let mut bus = PpuBus {
                mapper: self.mapper.as_deref_mut(),
                video: &mut self.video,
                nmi: &mut self.ppu_nmi,
            };
            self.ppu.step(&mut bus);
            if let Some(mapper) = self.mapper.as_mut() {
                mapper.tick_ppu_cycle();
            }
        }

        self.total_cycles = self.total_cycles.wrapping_add(1);
        self.debug.cpu_cycles = self.debug.cpu_cycles.wrapping_add(1);
        self.forward_ppu_nmi();
        self.drain_cartridge_signals();
    }

    fn forward_ppu_nmi(&mut self) {
        if !std::mem::take(&mut self.ppu_nmi) {
            return;
        }
        self.debug.nmi_raised = self.debug.nmi_raised.wrapping_add(1);
        if !self.pending_nmi {
            self.push_debug_event(format!(
                "PPU NMI at scanline/cycle {:?}",
                self.debug_ppu_scanline_cycle()
            ));
        }
        self.pending_nmi = true;
        self.port.raise_nmi();
    }

    fn drain_cartridge_signals(&mut self) {
        for signal in self.signals.take() {
            match signal {
                CartridgeSignal::BankSwitched(range) => {
                    self.debug.bank_switches = self.debug.bank_switches.wrapping_add(1);
                    let dropped = self.trace.invalidate(range.clone());
                    if dropped > 0 {
                        self.push_debug_event(format!(
                            "Bank switch ${:04X}-${:04X} dropped {dropped} trace entries",
                            range.start(),
                            range.end()
                        ));
                    }
                }
                CartridgeSignal::IrqTriggered => {
                    self.debug.irq_raised = self.debug.irq_raised.wrapping_add(1);
                    self.push_debug_event(format!(
                        "Mapper IRQ at CPU cycle {}",
                        self.total_cycles
                    ));
                    self.pending_irq = true;
                    self.port.raise_irq();
                }
                CartridgeSignal::IrqCancelled => {
                    self.debug.irq_cancelled = self.debug.irq_cancelled.wrapping_add(1);
                    self.pending_irq = false;
                    self.port.cancel_irq();
                }
            }
        }
    }

    pub fn cpu_read(&mut self, addr: u16) -> u8 {
        self.debug.cpu_reads = self.debug.cpu_reads.wrapping_add(1);
        self.debug.last_cpu_read_addr = addr;
        let value = match addr {
            0x0000..=0x1FFF => {
                self.debug.cpu_reads_ram = self.debug.cpu_reads_ram.wrapping_add(1);
                self.ram[(addr as usize) & 0x07FF]
            }
            0x2000..=0x3FFF => {
                self.debug.cpu_reads_ppu_regs = self.debug.cpu_reads_ppu_regs.wrapping_add(1);
                let reg = 0x2000 + (addr & 0x0007);
                let mut bus = PpuBus {
                    mapper: self.mapper.as_deref_mut(),
                    video: &mut self.video,
                    nmi: &mut self.ppu_nmi,
                };
                let value = self.ppu.cpu_read_register(reg, &mut bus);
                self.forward_ppu_nmi();
                value
            }
            0x4000..=0x401F => self.cpu_open_bus,
            _ => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                match self.mapper.as_mut() {
                    Some(mapper) => mapper.cpu_read(addr),
                    None => self.cpu_open_bus,
                }
            }
        };
        self.cpu_open_bus = value;
        value
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        self.debug.cpu_writes = self.debug.cpu_writes.wrapping_add(1);
        self.debug.last_cpu_write_addr = addr;
        self.debug.last_cpu_write_value = value;
        self.cpu_open_bus = value;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.cpu_writes_ram = self.debug.cpu_writes_ram.wrapping_add(1);
                self.ram[(addr as usize) & 0x07FF] = value;
            }
            0x2000..=0x3FFF => {
                self.debug.cpu_writes_ppu_regs = self.debug.cpu_writes_ppu_regs.wrapping_add(1);
                let reg = 0x2000 + (addr & 0x0007);
                let mut bus = PpuBus {
                    mapper: self.mapper.as_deref_mut(),
                    video: &mut self.video,
                    nmi: &mut self.ppu_nmi,
                };
                self.ppu.cpu_write_register(reg, value, &mut bus);
                self.forward_ppu_nmi();
            }
            0x4014 => {
                // A refused stall is kept in `last_host_error`.
                let _ = self.oam_dma(value);
            }
            0x4000..=0x401F => {}
            _ => {
                self.debug.cpu_writes_cart = self.debug.cpu_writes_cart.wrapping_add(1);
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value);
                }
                self.drain_cartridge_signals();
            }
        }
    }

    fn peek(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x4020..=0xFFFF => match self.mapper.as_mut() {
                Some(mapper) => mapper.cpu_read(addr),
                None => self.cpu_open_bus,
            },
            _ => self.cpu_open_bus,
        }
    }

    pub fn trace_fetch(&mut self, pc: u16) -> TraceEntry {
        let opcode = self.peek(pc);
        self.trace.record(pc, opcode)
    }

    // 513 stall cycles, 514 when the transfer starts on an odd CPU cycle.
    pub fn oam_dma(&mut self, page: u8) -> Result<u32, HostError> {
        self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (idx, slot) in bytes.iter_mut().enumerate() {
            *slot = self.cpu_read(base.wrapping_add(idx as u16));
        }
        self.ppu.write_oam_dma(page, &bytes);

        let cpu_phase = self.total_cycles & 0x01;
        let stall_cycles = OAM_DMA_CYCLES + cpu_phase as u32;
        self.dma_cycles = self.dma_cycles.saturating_add(stall_cycles);
        self.debug.dma_stall_cycles = self
            .debug
            .dma_stall_cycles
            .wrapping_add(stall_cycles as u64);
        self.push_debug_event(format!(
            "OAM DMA page=${page:02X} cpu_phase={cpu_phase} stall_cycles={stall_cycles}"
        ));

        match self.port.stall(stall_cycles) {
            Ok(()) => Ok(stall_cycles),
            Err(err) => {
                self.push_debug_event(format!("OAM DMA stall refused: {err}"));
                self.last_host_error = Some(err.clone());
                Err(err)
            }
        }
    }

    pub fn save_state(&self) -> Result<Vec<u8>> {
        let Some(mapper) = self.mapper.as_ref() else {
            bail!("cannot snapshot a console without a cartridge");
        };

        let mut mapper_state = SnapshotWriter::new();
        mapper.save_state(&mut mapper_state);

        let mut w = SnapshotWriter::new();
        w.put_blob(&self.ppu.save_state());
        w.put_bytes(&self.ram);
        w.put_u16(mapper.cartridge().mapper_id);
        w.put_u64(self.total_cycles);
        w.put_bool(self.pending_nmi);
        w.put_bool(self.pending_irq);
        w.put_u8(self.cpu_open_bus);
        w.put_blob(&mapper_state.into_inner());
        Ok(w.seal(SectionKind::Console))
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::open(bytes, SectionKind::Console)?;

        let mut ppu = self.ppu.clone();
        ppu.restore_state(r.get_blob()?)?;
        let ram: [u8; 2048] = r.get_array()?;
        let mapper_id = r.get_u16()?;
        let total_cycles = r.get_u64()?;
        let pending_nmi = r.get_bool("pending_nmi")?;
        let pending_irq = r.get_bool("pending_irq")?;
        let cpu_open_bus = r.get_u8()?;
        let mapper_state = r.get_blob()?;
        r.finish()?;

        let mapper = match self.mapper.as_mut() {
            Some(mapper) if mapper.cartridge().mapper_id == mapper_id => mapper,
            _ => {
                return Err(SnapshotError::InvalidField {
                    field: "mapper_id",
                    value: mapper_id as u64,
                });
            }
        };
        mapper.restore_state(mapper_state)?;

        self.ppu = ppu;
        self.ram = ram;
        self.total_cycles = total_cycles;
        self.pending_nmi = pending_nmi;
        self.pending_irq = pending_irq;
        self.cpu_open_bus = cpu_open_bus;
        self.ppu_nmi = false;
        self.signals.take();
        self.trace.invalidate(0x4020..=0xFFFF);
        self.push_debug_event(format!("State restored at CPU cycle {total_cycles}"));
        Ok(())
    }
}

pub struct PauseGuard<'a> {
    nes: &'a mut Nes,
    was_paused: bool,
}

impl Deref for PauseGuard<'_> {
    type Target = Nes;

    fn deref(&self) -> &Nes {
        self.nes
    }
}

impl DerefMut for PauseGuard<'_> {
    fn deref_mut(&mut self) -> &mut Nes {
        self.nes
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.nes.paused = self.was_paused;
    }
}
