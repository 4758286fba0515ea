use anyhow::{Result, bail};
use std::ops::RangeInclusive;
use std::rc::Rc;

use super::cartridge::Cartridge;
use super::snapshot::{SnapshotError, SnapshotReader, SnapshotWriter};

const PRG_WINDOW_32K: usize = 0x8000;
const PRG_BANK_8K: usize = 0x2000;
const CHR_BANK_8K: usize = 0x2000;
const CHR_BANK_1K: usize = 0x0400;
const AXROM_WORK_RAM: usize = 0x6000 - 0x4100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMode {
    Horizontal,
    Vertical,
    Single0,
    Single1,
    FourScreen,
}

impl MirrorMode {
    fn to_u8(self) -> u8 {
        match self {
            MirrorMode::Horizontal => 0,
            MirrorMode::Vertical => 1,
            MirrorMode::Single0 => 2,
            MirrorMode::Single1 => 3,
            MirrorMode::FourScreen => 4,
        }
    }

    fn from_u8(value: u8) -> Result<Self, SnapshotError> {
        Ok(match value {
            0 => MirrorMode::Horizontal,
            1 => MirrorMode::Vertical,
            2 => MirrorMode::Single0,
            3 => MirrorMode::Single1,
            4 => MirrorMode::FourScreen,
            other => {
                return Err(SnapshotError::InvalidField {
                    field: "mirror_mode",
                    value: other as u64,
                });
            }
        })
    }
}

pub trait MapperObserver {
    fn program_bank_switched(&self, _range: RangeInclusive<u16>) {}
    fn irq_triggered(&self) {}
    fn irq_cancelled(&self) {}
}

pub struct NullObserver;

impl MapperObserver for NullObserver {}

// cpu_* covers 0x4020..=0xFFFF, ppu_* the pattern tables. Anything else is a
// wiring bug and panics with the mapper name and address.
pub trait Mapper {
    fn name(&self) -> &'static str;
    fn cpu_read(&mut self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8);
    fn ppu_read(&mut self, addr: u16) -> u8;
    fn ppu_write(&mut self, addr: u16, value: u8);
    fn mirror_mode(&self) -> MirrorMode;
    fn tick_ppu_cycle(&mut self) {}
    fn irq_asserted(&self) -> bool {
        false
    }
    fn cartridge(&self) -> &Cartridge;
    fn save_state(&self, w: &mut SnapshotWriter);
    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError>;
    fn debug_peek_chr(&self, addr: u16) -> u8;
    fn debug_state(&self) -> String {
        String::new()
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        7 => "AxROM",
        22 => "Konami VRC2 Rev A",
        23 => "Konami VRC2 Rev B",
        _ => "Unsupported",
    }
}

pub fn create_mapper(cart: Cartridge, observer: Rc<dyn MapperObserver>) -> Result<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match cart.mapper_id {
        0 => Box::new(Nrom::new(cart)),
        7 => Box::new(AxRom::new(cart, observer)),
        22 => Box::new(Vrc2::new(cart, Vrc2Revision::A, observer)),
        23 => Box::new(Vrc2::new(cart, Vrc2Revision::B, observer)),
        id => bail!("mapper {id} is not supported"),
    };
    Ok(mapper)
}

fn unmapped(name: &str, access: &str, addr: u16) -> ! {
    panic!("{name}: unhandled {access} at ${addr:04X}");
}

fn ignored_write(name: &str, addr: u16, value: u8) {
    log::warn!("{name}: ignored write of ${value:02X} to ${addr:04X}");
}

fn open_bus(addr: u16) -> u8 {
    (addr >> 8) as u8
}

fn save_cartridge_ram(cart: &Cartridge, w: &mut SnapshotWriter) {
    w.put_blob(cart.save_ram());
    if cart.chr_is_ram() {
        w.put_blob(cart.chr());
    }
}

struct CartridgeRam<'a> {
    save: &'a [u8],
    chr: Option<&'a [u8]>,
}

impl<'a> CartridgeRam<'a> {
    fn read(cart: &Cartridge, r: &mut SnapshotReader<'a>) -> Result<Self, SnapshotError> {
        let save = r.get_blob_exact("save_ram", cart.save_ram().len())?;
        let chr = if cart.chr_is_ram() {
            Some(r.get_blob_exact("chr_ram", cart.chr().len())?)
        } else {
            None
        };
        Ok(Self { save, chr })
    }

    fn apply(self, cart: &mut Cartridge) {
        cart.save_ram_mut().copy_from_slice(self.save);
        if let (Some(image), Some(chr)) = (self.chr, cart.chr_mut()) {
            chr.copy_from_slice(image);
        }
    }
}

struct Nrom {
    cart: Cartridge,
}

impl Nrom {
    fn new(cart: Cartridge) -> Self {
        Self { cart }
    }
}

impl Mapper for Nrom {
    fn name(&self) -> &'static str {
        "NROM"
    }

    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x4020..=0x5FFF => open_bus(addr),
            0x6000..=0x7FFF => self.cart.read_save_ram(addr as usize - 0x6000),
            0x8000..=0xFFFF => self.cart.read_prg(0, PRG_WINDOW_32K, addr as usize - 0x8000),
            _ => unmapped(self.name(), "read", addr),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x6000..=0x7FFF => self.cart.write_save_ram(addr as usize - 0x6000, value),
            0x4020..=0x5FFF | 0x8000..=0xFFFF => ignored_write(self.name(), addr, value),
            _ => unmapped(self.name(), "write", addr),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern read", addr);
        }
        self.debug_peek_chr(addr)
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern write", addr);
        }
        if !self.cart.write_chr(0, CHR_BANK_8K, addr as usize, value) {
            ignored_write(self.name(), addr, value);
        }
    }

    fn mirror_mode(&self) -> MirrorMode {
        self.cart.mirror_mode
    }

    fn cartridge(&self) -> &Cartridge {
        &self.cart
    }

    fn save_state(&self, w: &mut SnapshotWriter) {
        save_cartridge_ram(&self.cart, w);
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::new(bytes);
        let ram = CartridgeRam::read(&self.cart, &mut r)?;
        r.finish()?;
        ram.apply(&mut self.cart);
        Ok(())
    }

    fn debug_peek_chr(&self, addr: u16) -> u8 {
        self.cart.read_chr(0, CHR_BANK_8K, addr as usize & 0x1FFF)
    }
}

struct AxRom {
    cart: Cartridge,
    observer: Rc<dyn MapperObserver>,
    work_ram: Vec<u8>,
    prg_bank: u8,
    mirror_mode: MirrorMode,
}

impl AxRom {
    fn new(cart: Cartridge, observer: Rc<dyn MapperObserver>) -> Self {
        Self {
            cart,
            observer,
            work_ram: vec![0; AXROM_WORK_RAM],
            prg_bank: 0,
            mirror_mode: MirrorMode::Single0,
        }
    }
}

impl Mapper for AxRom {
    fn name(&self) -> &'static str {
        "AxROM"
    }

    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x4020..=0x40FF => open_bus(addr),
            0x4100..=0x5FFF => self.work_ram[addr as usize - 0x4100],
            0x6000..=0x7FFF => self.cart.read_save_ram(addr as usize - 0x6000),
            0x8000..=0xFFFF => self.cart.read_prg(
                self.prg_bank as usize,
                PRG_WINDOW_32K,
                addr as usize - 0x8000,
            ),
            _ => unmapped(self.name(), "read", addr),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        match addr {
            0x4020..=0x40FF => ignored_write(self.name(), addr, value),
            0x4100..=0x5FFF => self.work_ram[addr as usize - 0x4100] = value,
            0x6000..=0x7FFF => self.cart.write_save_ram(addr as usize - 0x6000, value),
            0x8000..=0xFFFF => {
                // ---M-PPP
                let bank = value & 0x07;
                self.mirror_mode = if (value & 0x10) != 0 {
                    MirrorMode::Single1
                } else {
                    MirrorMode::Single0
                };
                if bank != self.prg_bank {
                    self.prg_bank = bank;
                    log::trace!("AxROM: program bank -> {bank}");
                    self.observer.program_bank_switched(0x8000..=0xFFFF);
                }
            }
            _ => unmapped(self.name(), "write", addr),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern read", addr);
        }
        self.debug_peek_chr(addr)
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern write", addr);
        }
        if !self.cart.write_chr(0, CHR_BANK_8K, addr as usize, value) {
            ignored_write(self.name(), addr, value);
        }
    }

    fn mirror_mode(&self) -> MirrorMode {
        self.mirror_mode
    }

    fn cartridge(&self) -> &Cartridge {
        &self.cart
    }

    fn save_state(&self, w: &mut SnapshotWriter) {
        w.put_u8(self.prg_bank);
        w.put_u8(self.mirror_mode.to_u8());
        w.put_blob(&self.work_ram);
        save_cartridge_ram(&self.cart, w);
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::new(bytes);
        let prg_bank = r.get_u8_max("axrom_prg_bank", 0x07)?;
        let mirror_mode = MirrorMode::from_u8(r.get_u8()?)?;
        let work_ram = r.get_blob_exact("axrom_work_ram", AXROM_WORK_RAM)?;
        let ram = CartridgeRam::read(&self.cart, &mut r)?;
        r.finish()?;

        self.prg_bank = prg_bank;
        self.mirror_mode = mirror_mode;
        self.work_ram.copy_from_slice(work_ram);
        ram.apply(&mut self.cart);
        Ok(())
    }

    fn debug_peek_chr(&self, addr: u16) -> u8 {
        self.cart.read_chr(0, CHR_BANK_8K, addr as usize & 0x1FFF)
    }

    fn debug_state(&self) -> String {
        format!(
            "AxROM prg_bank=${:02X} prg_32k_banks={} mirroring={:?}",
            self.prg_bank,
            self.cart.prg_banks(PRG_WINDOW_32K),
            self.mirror_mode
        )
    }
}

// Revision A swaps CPU lines A0 and A1 on the register select and drops
// the low bit of every CHR bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vrc2Revision {
    A,
    B,
}

const VIDEO_CYCLES_PER_CPU_CYCLE: u8 = 3;
const VRC_IRQ_PRESCALER: u16 = 341;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VrcIrq {
    reload: u8,
    counter: u8,
    prescaler: u16,
    divider: u8,
    enabled: bool,
    enable_on_ack: bool,
    cycle_mode: bool,
    triggered: bool,
}

impl VrcIrq {
    fn write_reload_low(&mut self, value: u8) {
        self.reload = (self.reload & 0xF0) | (value & 0x0F);
    }

    fn write_reload_high(&mut self, value: u8) {
        self.reload = (self.reload & 0x0F) | ((value & 0x0F) << 4);
    }

    fn write_control(&mut self, value: u8) -> bool {
        self.enable_on_ack = (value & 0x01) != 0;
        self.enabled = (value & 0x02) != 0;
        self.cycle_mode = (value & 0x04) != 0;
        if self.enabled {
            self.counter = self.reload;
            self.prescaler = 0;
        }
        std::mem::take(&mut self.triggered)
    }

    fn acknowledge(&mut self) -> bool {
        self.enabled = self.enable_on_ack;
        std::mem::take(&mut self.triggered)
    }

    fn tick_ppu_cycle(&mut self) -> bool {
        self.divider += 1;
        if self.divider < VIDEO_CYCLES_PER_CPU_CYCLE {
            return false;
        }
        self.divider = 0;

        if !self.enabled {
            return false;
        }
        if !self.cycle_mode {
            self.prescaler += 1;
            if self.prescaler < VRC_IRQ_PRESCALER {
                return false;
            }
            self.prescaler = 0;
        }
        self.clock_counter()
    }

    fn clock_counter(&mut self) -> bool {
        if self.counter != 0xFF {
            self.counter += 1;
            return false;
        }
        self.counter = self.reload;
        if self.triggered {
            return false;
        }
        self.triggered = true;
        true
    }

    fn save(&self, w: &mut SnapshotWriter) {
        w.put_u8(self.reload);
        w.put_u8(self.counter);
        w.put_u16(self.prescaler);
        w.put_u8(self.divider);
        w.put_bool(self.enabled);
        w.put_bool(self.enable_on_ack);
        w.put_bool(self.cycle_mode);
        w.put_bool(self.triggered);
    }

    fn read(r: &mut SnapshotReader<'_>) -> Result<Self, SnapshotError> {
        Ok(Self {
            reload: r.get_u8()?,
            counter: r.get_u8()?,
            prescaler: r.get_u16_max("irq_prescaler", VRC_IRQ_PRESCALER - 1)?,
            divider: r.get_u8_max("irq_divider", VIDEO_CYCLES_PER_CPU_CYCLE - 1)?,
            enabled: r.get_bool("irq_enabled")?,
            enable_on_ack: r.get_bool("irq_enable_on_ack")?,
            cycle_mode: r.get_bool("irq_cycle_mode")?,
            triggered: r.get_bool("irq_triggered")?,
        })
    }
}

struct Vrc2 {
    cart: Cartridge,
    revision: Vrc2Revision,
    observer: Rc<dyn MapperObserver>,
    prg_banks: [u8; 2],
    chr_banks: [u8; 8],
    mirror_mode: MirrorMode,
    irq: VrcIrq,
}

impl Vrc2 {
    fn new(cart: Cartridge, revision: Vrc2Revision, observer: Rc<dyn MapperObserver>) -> Self {
        Self {
            cart,
            revision,
            observer,
            prg_banks: [0, 1],
            chr_banks: [0; 8],
            mirror_mode: MirrorMode::Vertical,
            irq: VrcIrq::default(),
        }
    }

    // A12..A15 plus the two low lines, normalised to revision B wiring.
    fn register(&self, addr: u16) -> u16 {
        let addr = addr & 0xF003;
        match self.revision {
            Vrc2Revision::A => (addr & 0xF000) | ((addr & 0x01) << 1) | ((addr & 0x02) >> 1),
            Vrc2Revision::B => addr,
        }
    }

    fn select_prg(&mut self, slot: usize, value: u8) {
        let bank = value & 0x1F;
        if self.prg_banks[slot] == bank {
            return;
        }
        self.prg_banks[slot] = bank;
        let start = 0x8000 + (slot as u16) * 0x2000;
        log::trace!("{}: program slot {slot} -> bank {bank}", self.name());
        self.observer.program_bank_switched(start..=start + 0x1FFF);
    }

    fn write_chr_nibble(&mut self, reg: u16, value: u8) {
        let low2 = reg & 0x03;
        let index = ((((reg >> 12) - 0xB) * 2) + (low2 >> 1)) as usize;
        let bank = &mut self.chr_banks[index];
        if (low2 & 0x01) == 0 {
            *bank = (*bank & 0xF0) | (value & 0x0F);
        } else {
            *bank = (*bank & 0x0F) | ((value & 0x0F) << 4);
        }
    }

    fn chr_bank(&self, addr: u16) -> usize {
        let bank = self.chr_banks[(addr as usize >> 10) & 0x07] as usize;
        match self.revision {
            Vrc2Revision::A => bank >> 1,
            Vrc2Revision::B => bank,
        }
    }

    fn irq_withdrawn(&self, withdrawn: bool) {
        if withdrawn {
            log::debug!("{}: IRQ acknowledged", self.name());
            self.observer.irq_cancelled();
        }
    }

    #[cfg(test)]
    fn irq_counter(&self) -> u8 {
        self.irq.counter
    }
}

impl Mapper for Vrc2 {
    fn name(&self) -> &'static str {
        match self.revision {
            Vrc2Revision::A => "Konami VRC2 Rev A",
            Vrc2Revision::B => "Konami VRC2 Rev B",
        }
    }

    fn cpu_read(&mut self, addr: u16) -> u8 {
        match addr {
            0x4020..=0x5FFF => open_bus(addr),
            0x6000..=0x7FFF => self.cart.read_save_ram(addr as usize - 0x6000),
            0x8000..=0x9FFF => {
                self.cart
                    .read_prg(self.prg_banks[0] as usize, PRG_BANK_8K, addr as usize & 0x1FFF)
            }
            0xA000..=0xBFFF => {
                self.cart
                    .read_prg(self.prg_banks[1] as usize, PRG_BANK_8K, addr as usize & 0x1FFF)
            }
            0xC000..=0xFFFF => {
                let fixed = self.cart.prg_banks(PRG_BANK_8K).saturating_sub(2);
                let bank = fixed + ((addr as usize >> 13) & 0x01);
                self.cart.read_prg(bank, PRG_BANK_8K, addr as usize & 0x1FFF)
            }
            _ => unmapped(self.name(), "read", addr),
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr < 0x8000 {
            match addr {
                0x6000..=0x7FFF => self.cart.write_save_ram(addr as usize - 0x6000, value),
                0x4020..=0x5FFF => ignored_write(self.name(), addr, value),
                _ => unmapped(self.name(), "write", addr),
            }
            return;
        }

        let reg = self.register(addr);
        match reg {
            0x8000..=0x8FFF => self.select_prg(0, value),
            0x9000..=0x9FFF => {
                self.mirror_mode = if (value & 0x01) != 0 {
                    MirrorMode::Horizontal
                } else {
                    MirrorMode::Vertical
                };
            }
            0xA000..=0xAFFF => self.select_prg(1, value),
            0xB000..=0xEFFF => self.write_chr_nibble(reg, value),
            0xF000 => self.irq.write_reload_low(value),
            0xF001 => self.irq.write_reload_high(value),
            0xF002 => {
                let withdrawn = self.irq.write_control(value);
                self.irq_withdrawn(withdrawn);
            }
            0xF003 => {
                let withdrawn = self.irq.acknowledge();
                self.irq_withdrawn(withdrawn);
            }
            _ => ignored_write(self.name(), addr, value),
        }
    }

    fn ppu_read(&mut self, addr: u16) -> u8 {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern read", addr);
        }
        self.debug_peek_chr(addr)
    }

    fn ppu_write(&mut self, addr: u16, value: u8) {
        if addr >= 0x2000 {
            unmapped(self.name(), "pattern write", addr);
        }
        let bank = self.chr_bank(addr);
        if !self
            .cart
            .write_chr(bank, CHR_BANK_1K, addr as usize & 0x03FF, value)
        {
            ignored_write(self.name(), addr, value);
        }
    }

    fn mirror_mode(&self) -> MirrorMode {
        self.mirror_mode
    }

    fn tick_ppu_cycle(&mut self) {
        if self.irq.tick_ppu_cycle() {
            log::debug!("{}: IRQ fired, reload=${:02X}", self.name(), self.irq.reload);
            self.observer.irq_triggered();
        }
    }

    fn irq_asserted(&self) -> bool {
        self.irq.triggered
    }

    fn cartridge(&self) -> &Cartridge {
        &self.cart
    }

    fn save_state(&self, w: &mut SnapshotWriter) {
        w.put_bytes(&self.prg_banks);
        w.put_bytes(&self.chr_banks);
        w.put_u8(self.mirror_mode.to_u8());
        self.irq.save(w);
        save_cartridge_ram(&self.cart, w);
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::new(bytes);
        let prg_banks: [u8; 2] = r.get_array()?;
        if let Some(&bad) = prg_banks.iter().find(|&&bank| bank > 0x1F) {
            return Err(SnapshotError::InvalidField {
                field: "vrc2_prg_bank",
                value: bad as u64,
            });
        }
        let chr_banks: [u8; 8] = r.get_array()?;
        let mirror_mode = MirrorMode::from_u8(r.get_u8()?)?;
        let irq = VrcIrq::read(&mut r)?;
        let ram = CartridgeRam::read(&self.cart, &mut r)?;
        r.finish()?;

        self.prg_banks = prg_banks;
        self.chr_banks = chr_banks;
        self.mirror_mode = mirror_mode;
        self.irq = irq;
        ram.apply(&mut self.cart);
        Ok(())
    }

    fn debug_peek_chr(&self, addr: u16) -> u8 {
        self.cart
            .read_chr(self.chr_bank(addr), CHR_BANK_1K, addr as usize & 0x03FF)
    }

    fn debug_state(&self) -> String {
        format!(
            "{} prg={:02X?} chr={:02X?} mirroring={:?} irq_reload=${:02X} irq_counter=${:02X} irq_enabled={} irq_pending={}",
            self.name(),
            self.prg_banks,
            self.chr_banks,
            self.mirror_mode,
            self.irq.reload,
            self.irq.counter,
            self.irq.enabled,
            self.irq.triggered
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Signal {
        BankSwitch(RangeInclusive<u16>),
        IrqTriggered,
        IrqCancelled,
    }

    #[derive(Default)]
    struct Recorder {
        signals: RefCell<Vec<Signal>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Signal> {
            std::mem::take(&mut *self.signals.borrow_mut())
        }
    }

    impl MapperObserver for Recorder {
        fn program_bank_switched(&self, range: RangeInclusive<u16>) {
            self.signals.borrow_mut().push(Signal::BankSwitch(range));
        }

        fn irq_triggered(&self) {
            self.signals.borrow_mut().push(Signal::IrqTriggered);
        }

        fn irq_cancelled(&self) {
            self.signals.borrow_mut().push(Signal::IrqCancelled);
        }
    }

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_cart(mapper_id: u16, prg_rom: Vec<u8>, chr: Vec<u8>) -> Cartridge {
        Cartridge::new(mapper_id, prg_rom, chr, Vec::new()).unwrap()
    }

    fn axrom(prg_banks: usize) -> (AxRom, Rc<Recorder>) {
        let recorder = Rc::new(Recorder::default());
        let prg = patterned_banks(prg_banks * 0x8000, 0x8000);
        let mapper = AxRom::new(make_cart(7, prg, Vec::new()), recorder.clone());
        (mapper, recorder)
    }

    fn vrc2(revision: Vrc2Revision) -> (Vrc2, Rc<Recorder>) {
        let recorder = Rc::new(Recorder::default());
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(32 * 0x0400, 0x0400);
        let id = if revision == Vrc2Revision::A { 22 } else { 23 };
        let mapper = Vrc2::new(make_cart(id, prg, chr), revision, recorder.clone());
        (mapper, recorder)
    }

    #[test]
    fn nrom_mirrors_16k_program_rom() {
        let prg = patterned_banks(0x4000, 0x4000);
        let mut mapper = Nrom::new(make_cart(0, prg, vec![0x42; 0x2000]));
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert_eq!(mapper.cpu_read(0xC000), 1);
        assert_eq!(mapper.ppu_read(0x1FFF), 0x42);
        mapper.ppu_write(0x0000, 0x11);
        assert_eq!(mapper.ppu_read(0x0000), 0x42);
    }

    #[test]
    fn axrom_selects_bank_and_single_screen_mirroring() {
        let (mut mapper, _) = axrom(8);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Single0);

        mapper.cpu_write(0x8000, 0x13);
        assert_eq!(mapper.cpu_read(0x8000), 4);
        assert_eq!(mapper.cpu_read(0xFFFF), 4);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Single1);

        mapper.cpu_write(0xFFFF, 0x0D);
        assert_eq!(mapper.cpu_read(0x8000), 6);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Single0);
    }

    #[test]
    fn axrom_signals_bank_switch_only_on_change() {
        let (mut mapper, recorder) = axrom(4);
        mapper.cpu_write(0x8000, 0x02);
        assert_eq!(recorder.take(), vec![Signal::BankSwitch(0x8000..=0xFFFF)]);

        mapper.cpu_write(0x8000, 0x12);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Single1);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn axrom_bank_reduced_modulo_bank_count() {
        let (mut mapper, _) = axrom(2);
        mapper.cpu_write(0x8000, 0x07);
        assert_eq!(mapper.cpu_read(0x8000), 2);
        mapper.cpu_write(0x8000, 0x06);
        assert_eq!(mapper.cpu_read(0x8000), 1);
    }

    #[test]
    fn axrom_work_ram_save_ram_and_open_bus() {
        let (mut mapper, _) = axrom(1);
        mapper.cpu_write(0x4100, 0xAA);
        mapper.cpu_write(0x5FFF, 0xBB);
        mapper.cpu_write(0x6000, 0xCC);
        assert_eq!(mapper.cpu_read(0x4100), 0xAA);
        assert_eq!(mapper.cpu_read(0x5FFF), 0xBB);
        assert_eq!(mapper.cpu_read(0x6000), 0xCC);
        assert_eq!(mapper.cpu_read(0x4080), 0x40);
        assert_eq!(mapper.cartridge().save_ram()[0], 0xCC);

        mapper.ppu_write(0x0123, 0x5A);
        assert_eq!(mapper.ppu_read(0x0123), 0x5A);
    }

    #[test]
    #[should_panic(expected = "AxROM: unhandled read at $2002")]
    fn axrom_read_outside_window_is_contract_violation() {
        let (mut mapper, _) = axrom(1);
        mapper.cpu_read(0x2002);
    }

    #[test]
    #[should_panic(expected = "Konami VRC2 Rev B: unhandled pattern read at $2000")]
    fn vrc2_pattern_read_outside_window_is_contract_violation() {
        let (mut mapper, _) = vrc2(Vrc2Revision::B);
        mapper.ppu_read(0x2000);
    }

    #[test]
    fn vrc2_program_banks_with_fixed_last_two() {
        let (mut mapper, recorder) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0x8000, 0x03);
        mapper.cpu_write(0xA000, 0x25);
        assert_eq!(mapper.cpu_read(0x8000), 4);
        assert_eq!(mapper.cpu_read(0xA000), 6);
        assert_eq!(mapper.cpu_read(0xC000), 7);
        assert_eq!(mapper.cpu_read(0xE000), 8);
        assert_eq!(
            recorder.take(),
            vec![
                Signal::BankSwitch(0x8000..=0x9FFF),
                Signal::BankSwitch(0xA000..=0xBFFF)
            ]
        );

        // 0x1D wraps modulo the eight 8 KiB banks.
        mapper.cpu_write(0x8000, 0x1D);
        assert_eq!(mapper.cpu_read(0x9FFF), 6);
        mapper.cpu_write(0x8000, 0x1D);
        assert_eq!(recorder.take().len(), 1);
    }

    #[test]
    fn vrc2_mirroring_follows_bit_zero() {
        let (mut mapper, _) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0x9000, 0x01);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Horizontal);
        mapper.cpu_write(0x9000, 0x00);
        assert_eq!(mapper.mirror_mode(), MirrorMode::Vertical);
    }

    #[test]
    fn vrc2b_chr_registers_take_nibble_pairs() {
        let (mut mapper, _) = vrc2(Vrc2Revision::B);
        // 0xB000/0xB001 -> bank 0 low/high, 0xB002/0xB003 -> bank 1.
        mapper.cpu_write(0xB000, 0x05);
        mapper.cpu_write(0xB001, 0x01);
        mapper.cpu_write(0xB002, 0x03);
        mapper.cpu_write(0xE003, 0x00);
        mapper.cpu_write(0xE002, 0x07);
        assert_eq!(mapper.ppu_read(0x0000), 0x16);
        assert_eq!(mapper.ppu_read(0x0400), 0x04);
        assert_eq!(mapper.ppu_read(0x1C00), 0x08);
    }

    #[test]
    fn vrc2a_swaps_low_address_lines_and_halves_chr_banks() {
        let (mut rev_a, _) = vrc2(Vrc2Revision::A);
        let (mut rev_b, _) = vrc2(Vrc2Revision::B);

        // Rev A register 0xB001 is rev B register 0xB002 (bank 1 low nibble).
        rev_a.cpu_write(0xB001, 0x06);
        rev_b.cpu_write(0xB002, 0x06);
        assert_eq!(rev_b.ppu_read(0x0400), 7);
        assert_eq!(rev_a.ppu_read(0x0400), 4);

        // Decoding ignores A2..A11, so 0xB00E behaves like 0xB002 on both.
        rev_b.cpu_write(0xB00E, 0x02);
        assert_eq!(rev_b.ppu_read(0x0400), 3);
    }

    #[test]
    fn vrc2_open_bus_and_tolerated_unknown_writes() {
        let (mut mapper, recorder) = vrc2(Vrc2Revision::B);
        assert_eq!(mapper.cpu_read(0x5123), 0x51);
        mapper.cpu_write(0x4800, 0xFF);
        assert_eq!(mapper.cpu_read(0x8000), 1);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn vrc2_scanline_mode_prescaler_counts_once_per_341_cpu_cycles() {
        let (mut mapper, _) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0xF000, 0x0A);
        mapper.cpu_write(0xF001, 0x00);
        mapper.cpu_write(0xF002, 0x02);
        assert_eq!(mapper.irq_counter(), 10);

        for _ in 0..(341 * 3 - 1) {
            mapper.tick_ppu_cycle();
        }
        assert_eq!(mapper.irq_counter(), 10);
        mapper.tick_ppu_cycle();
        assert_eq!(mapper.irq_counter(), 11);
    }

    #[test]
    fn vrc2_irq_fires_once_per_wrap_until_acknowledged() {
        let (mut mapper, recorder) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0xF000, 0x0E);
        mapper.cpu_write(0xF001, 0x0F);
        // Cycle mode, enabled, re-enable on acknowledge.
        mapper.cpu_write(0xF002, 0x07);

        for _ in 0..3 {
            mapper.tick_ppu_cycle();
        }
        assert_eq!(mapper.irq_counter(), 0xFF);
        assert!(!mapper.irq_asserted());
        for _ in 0..3 {
            mapper.tick_ppu_cycle();
        }
        assert_eq!(mapper.irq_counter(), 0xFE);
        assert!(mapper.irq_asserted());
        assert_eq!(recorder.take(), vec![Signal::IrqTriggered]);

        // A second wrap before acknowledgement stays silent.
        for _ in 0..6 {
            mapper.tick_ppu_cycle();
        }
        assert!(recorder.take().is_empty());

        mapper.cpu_write(0xF003, 0x00);
        assert!(!mapper.irq_asserted());
        assert_eq!(recorder.take(), vec![Signal::IrqCancelled]);

        for _ in 0..6 {
            mapper.tick_ppu_cycle();
        }
        assert_eq!(recorder.take(), vec![Signal::IrqTriggered]);
    }

    #[test]
    fn vrc2_acknowledge_disables_without_enable_on_ack() {
        let (mut mapper, recorder) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0xF000, 0x0F);
        mapper.cpu_write(0xF001, 0x0F);
        mapper.cpu_write(0xF002, 0x06);
        for _ in 0..3 {
            mapper.tick_ppu_cycle();
        }
        assert_eq!(recorder.take(), vec![Signal::IrqTriggered]);

        mapper.cpu_write(0xF003, 0x00);
        assert_eq!(recorder.take(), vec![Signal::IrqCancelled]);
        for _ in 0..30 {
            mapper.tick_ppu_cycle();
        }
        assert!(recorder.take().is_empty());
        assert_eq!(mapper.irq_counter(), 0xFF);
    }

    #[test]
    fn vrc2_state_restores_and_rejects_truncated_input() {
        let (mut mapper, _) = vrc2(Vrc2Revision::B);
        mapper.cpu_write(0x8000, 0x04);
        mapper.cpu_write(0xC001, 0x01);
        mapper.cpu_write(0x9000, 0x01);
        mapper.cpu_write(0xF000, 0x03);
        mapper.cpu_write(0xF002, 0x02);
        mapper.cpu_write(0x6010, 0x99);
        let mut w = SnapshotWriter::new();
        mapper.save_state(&mut w);
        let bytes = w.into_inner();

        let (mut fresh, _) = vrc2(Vrc2Revision::B);
        fresh.restore_state(&bytes).unwrap();
        assert_eq!(fresh.debug_state(), mapper.debug_state());
        assert_eq!(fresh.cpu_read(0x8000), 5);
        assert_eq!(fresh.cpu_read(0x6010), 0x99);

        let (mut other, _) = vrc2(Vrc2Revision::B);
        let before = other.debug_state();
        let err = other.restore_state(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(err, SnapshotError::Truncated { .. }));
        assert_eq!(other.debug_state(), before);
        assert_eq!(other.cpu_read(0x6010), 0);

        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(other.restore_state(&padded), Err(SnapshotError::TrailingBytes(1)));
        assert_eq!(other.debug_state(), before);
    }

    #[test]
    fn create_mapper_rejects_unknown_ids() {
        let cart = make_cart(4, vec![0; 0x8000], Vec::new());
        assert!(create_mapper(cart, Rc::new(NullObserver)).is_err());
        let cart = make_cart(7, vec![0; 0x8000], Vec::new());
        assert_eq!(create_mapper(cart, Rc::new(NullObserver)).unwrap().name(), "AxROM");
    }
}
