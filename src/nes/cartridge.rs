use anyhow::{Context, Result, anyhow, bail};
use std::{fs, path::Path};

use super::mapper::MirrorMode;

const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;
const DEFAULT_SAVE_RAM: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub submapper_id: u8,
    pub mirror_mode: MirrorMode,
    pub has_battery: bool,
    prg_rom: Vec<u8>,
    chr: Vec<u8>,
    chr_is_ram: bool,
    save_ram: Vec<u8>,
}

impl Cartridge {
    pub fn new(mapper_id: u16, prg_rom: Vec<u8>, chr: Vec<u8>, save_ram: Vec<u8>) -> Result<Self> {
        if prg_rom.is_empty() {
            return Err(anyhow!("invalid PRG ROM: empty payload"));
        }
        let (chr, chr_is_ram) = if chr.is_empty() {
            (vec![0; CHR_UNIT], true)
        } else {
            (chr, false)
        };
        let save_ram = if save_ram.is_empty() {
            vec![0; DEFAULT_SAVE_RAM]
        } else {
            save_ram
        };
        Ok(Self {
            mapper_id,
            submapper_id: 0,
            mirror_mode: MirrorMode::Horizontal,
            has_battery: false,
            prg_rom,
            chr,
            chr_is_ram,
            save_ram,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mapper_id_low = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        let mapper_id = if is_nes2 {
            mapper_id_low | (((bytes[8] as u16) & 0x0F) << 8)
        } else {
            mapper_id_low
        };
        let submapper_id = if is_nes2 { bytes[8] >> 4 } else { 0 };
        let mirror_mode = if (flags6 & 0x08) != 0 {
            MirrorMode::FourScreen
        } else if (flags6 & 0x01) != 0 {
            MirrorMode::Vertical
        } else {
            MirrorMode::Horizontal
        };

        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery = (flags6 & 0x02) != 0;

        let (prg_rom_size, chr_rom_size, save_ram_size) = if is_nes2 {
            let prg_msb = (bytes[9] & 0x0F) as usize;
            let chr_msb = (bytes[9] >> 4) as usize;
            if prg_msb == 0x0F || chr_msb == 0x0F {
                bail!("NES 2.0 exponent/multiplier ROM size encoding is not supported");
            }
            let prg_units = ((prg_msb << 8) | bytes[4] as usize).max(1);
            let chr_units = (chr_msb << 8) | bytes[5] as usize;
            let shift = bytes[10] >> 4;
            let save_ram = if shift == 0 {
                DEFAULT_SAVE_RAM
            } else {
                64usize << shift
            };
            (prg_units * PRG_UNIT, chr_units * CHR_UNIT, save_ram)
        } else {
            let prg_units = (bytes[4] as usize).max(1);
            let chr_units = bytes[5] as usize;
            let ram_units = if bytes[8] == 0 { 1 } else { bytes[8] as usize };
            (prg_units * PRG_UNIT, chr_units * CHR_UNIT, ram_units * DEFAULT_SAVE_RAM)
        };

        let mut cursor = 16usize;
        if trainer_present {
            cursor += 512;
        }

        if bytes.len() < cursor + prg_rom_size {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_rom_size
            );
        }
        let prg_rom = bytes[cursor..cursor + prg_rom_size].to_vec();
        cursor += prg_rom_size;

        let chr = if chr_rom_size == 0 {
            Vec::new()
        } else {
            if bytes.len() < cursor + chr_rom_size {
                bail!(
                    "ROM truncated: expected {} CHR bytes but file ended early",
                    chr_rom_size
                );
            }
            bytes[cursor..cursor + chr_rom_size].to_vec()
        };

        let mut cart = Self::new(mapper_id, prg_rom, chr, vec![0; save_ram_size])?;
        cart.submapper_id = submapper_id;
        cart.mirror_mode = mirror_mode;
        cart.has_battery = has_battery;
        Ok(cart)
    }

    pub fn prg_rom(&self) -> &[u8] {
        &self.prg_rom
    }

    pub fn chr(&self) -> &[u8] {
        &self.chr
    }

    pub fn chr_is_ram(&self) -> bool {
        self.chr_is_ram
    }

    pub fn save_ram(&self) -> &[u8] {
        &self.save_ram
    }

    pub(crate) fn chr_mut(&mut self) -> Option<&mut [u8]> {
        if self.chr_is_ram {
            Some(&mut self.chr)
        } else {
            None
        }
    }

    pub(crate) fn save_ram_mut(&mut self) -> &mut [u8] {
        &mut self.save_ram
    }

    pub fn prg_banks(&self, size: usize) -> usize {
        (self.prg_rom.len() / size).max(1)
    }

    pub fn chr_banks(&self, size: usize) -> usize {
        (self.chr.len() / size).max(1)
    }

    pub fn read_prg(&self, bank: usize, size: usize, offset: usize) -> u8 {
        let bank = bank % self.prg_banks(size);
        self.prg_rom[(bank * size + offset) % self.prg_rom.len()]
    }

    pub fn read_chr(&self, bank: usize, size: usize, offset: usize) -> u8 {
        let bank = bank % self.chr_banks(size);
        self.chr[(bank * size + offset) % self.chr.len()]
    }

    pub fn write_chr(&mut self, bank: usize, size: usize, offset: usize, value: u8) -> bool {
        let bank = bank % self.chr_banks(size);
        let len = self.chr.len();
        match self.chr_mut() {
            Some(chr) => {
                chr[(bank * size + offset) % len] = value;
                true
            }
            None => false,
        }
    }

    pub fn read_save_ram(&self, offset: usize) -> u8 {
        self.save_ram[offset % self.save_ram.len()]
    }

    pub fn write_save_ram(&mut self, offset: usize, value: u8) {
        let len = self.save_ram.len();
        self.save_ram[offset % len] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ines_image(mapper: u8, prg_units: u8, chr_units: u8, flags6_low: u8) -> Vec<u8> {
        let mut rom = vec![0u8; 16];
        rom[0..4].copy_from_slice(b"NES\x1A");
        rom[4] = prg_units;
        rom[5] = chr_units;
        rom[6] = (mapper << 4) | flags6_low;
        rom[7] = mapper & 0xF0;
        rom.extend(std::iter::repeat_n(0xEA, prg_units as usize * PRG_UNIT));
        rom.extend(std::iter::repeat_n(0x55, chr_units as usize * CHR_UNIT));
        rom
    }

    #[test]
    fn parses_mapper_and_vertical_mirroring() {
        let cart = Cartridge::from_bytes(&ines_image(7, 2, 0, 0x01)).unwrap();
        assert_eq!(cart.mapper_id, 7);
        assert_eq!(cart.mirror_mode, MirrorMode::Vertical);
        assert_eq!(cart.prg_rom().len(), 2 * PRG_UNIT);
        assert!(cart.chr_is_ram());
        assert_eq!(cart.chr().len(), CHR_UNIT);
        assert_eq!(cart.save_ram().len(), DEFAULT_SAVE_RAM);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut rom = ines_image(0, 1, 1, 0);
        rom[0] = b'X';
        assert!(Cartridge::from_bytes(&rom).is_err());

        let rom = ines_image(0, 1, 1, 0);
        assert!(Cartridge::from_bytes(&rom[..rom.len() - 1]).is_err());
    }

    #[test]
    fn bank_reads_wrap_modulo_bank_count() {
        let prg: Vec<u8> = (0..4).flat_map(|b| vec![b as u8; 0x2000]).collect();
        let cart = Cartridge::new(22, prg, Vec::new(), Vec::new()).unwrap();
        assert_eq!(cart.read_prg(5, 0x2000, 0), 1);
        assert_eq!(cart.read_prg(3, 0x2000, 0x1FFF), 3);
    }

    #[test]
    fn chr_rom_rejects_writes() {
        let mut cart = Cartridge::new(0, vec![0; PRG_UNIT], vec![7; CHR_UNIT], Vec::new()).unwrap();
        assert!(!cart.write_chr(0, CHR_UNIT, 0, 1));
        assert_eq!(cart.read_chr(0, CHR_UNIT, 0), 7);
    }
}
