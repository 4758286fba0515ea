use super::config::PpuConfig;
use super::mapper::MirrorMode;
use super::snapshot::{SectionKind, SnapshotError, SnapshotReader, SnapshotWriter};

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

const CTRL_NAMETABLE_SELECT: u8 = 0x03;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_NMI_ENABLE: u8 = 0x80;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const LAST_CYCLE: u16 = 340;
const VBLANK_LINE: u16 = 241;
const PRE_RENDER_LINE: u16 = 261;
const MAX_SPRITES_PER_LINE: usize = 8;
const VRAM_ADDR_MASK: u16 = 0x7FFF;

pub trait PpuHost {
    fn read_pattern(&mut self, addr: u16) -> u8;
    fn write_pattern(&mut self, addr: u16, value: u8);
    fn mirror_mode(&self) -> MirrorMode;
    fn write_pixel(&mut self, _x: u8, _y: u8, _palette_index: u8, _color: u8) {}
    fn present_frame(&mut self) {}
    fn raise_nmi(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub ticks: u64,
    pub vblank_entries: u64,
    pub nmi_edges: u64,
    pub nmi_raised: u64,
    pub sprite_overflow_events: u64,
    pub sprite_overflow_last_scanline: u16,
    pub sprite0_hit_events: u64,
    pub sprite0_hit_last_scanline: u16,
    pub sprite0_hit_last_cycle: u16,
    pub status_reads: u64,
    pub register_writes: u64,
    pub pattern_reads: u64,
    pub nametable_reads: u64,
    pub palette_reads: u64,
    pub pattern_writes: u64,
    pub nametable_writes: u64,
    pub palette_writes: u64,
    pub last_read_addr: u16,
    pub last_write_addr: u16,
}

#[derive(Debug, Clone)]
pub struct Ppu {
    ctrl: u8,
    mask: u8,
    register_latch: u8,
    sprite_zero_hit: bool,
    sprite_overflow: bool,

    nmi_occurred: bool,
    nmi_output: bool,
    nmi_previous: bool,
    nmi_delay: u8,
    nmi_delay_cycles: u8,

    oam_addr: u8,
    oam: [u8; 256],
    nametables: [u8; 2048],
    palette: [u8; 32],

    v: u16,
    t: u16,
    fine_x: u8,
    write_toggle: bool,
    read_buffer: u8,

    cycle: u16,
    scanline: u16,
    even_frame: bool,

    nametable_byte: u8,
    attribute_byte: u8,
    low_tile_byte: u8,
    high_tile_byte: u8,
    tile_data: u64,

    sprite_count: usize,
    sprite_patterns: [u32; MAX_SPRITES_PER_LINE],
    sprite_positions: [u8; MAX_SPRITES_PER_LINE],
    sprite_priorities: [u8; MAX_SPRITES_PER_LINE],
    sprite_indexes: [u8; MAX_SPRITES_PER_LINE],

    debug: PpuDebugCounters,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new(&PpuConfig::default())
    }
}

impl Ppu {
    pub fn new(config: &PpuConfig) -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            register_latch: 0,
            sprite_zero_hit: false,
            sprite_overflow: false,
            nmi_occurred: false,
            nmi_output: false,
            nmi_previous: false,
            nmi_delay: 0,
            nmi_delay_cycles: config.nmi_delay,
            oam_addr: 0,
            oam: [0; 256],
            nametables: [0; 2048],
            // Keep startup background black for deterministic frame digests.
            palette: [0x0F; 32],
            v: 0,
            t: 0,
            fine_x: 0,
            write_toggle: false,
            read_buffer: 0,
            cycle: LAST_CYCLE,
            scanline: 240,
            even_frame: false,
            nametable_byte: 0,
            attribute_byte: 0,
            low_tile_byte: 0,
            high_tile_byte: 0,
            tile_data: 0,
            sprite_count: 0,
            sprite_patterns: [0; MAX_SPRITES_PER_LINE],
            sprite_positions: [0; MAX_SPRITES_PER_LINE],
            sprite_priorities: [0; MAX_SPRITES_PER_LINE],
            sprite_indexes: [0; MAX_SPRITES_PER_LINE],
            debug: PpuDebugCounters::default(),
        }
    }

    // Beam parks at (240, 340); memory contents survive.
    pub fn reset(&mut self, host: &mut dyn PpuHost) {
        self.cycle = LAST_CYCLE;
        self.scanline = 240;
        self.write_control(0, host);
        self.write_mask(0);
        self.write_oam_addr(0);
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn cycle(&self) -> u16 {
        self.cycle
    }

    pub fn even_frame(&self) -> bool {
        self.even_frame
    }

    pub fn vram_addr(&self) -> u16 {
        self.v
    }

    pub fn temp_addr(&self) -> u16 {
        self.t
    }

    pub fn fine_x(&self) -> u8 {
        self.fine_x
    }

    pub fn write_toggle(&self) -> bool {
        self.write_toggle
    }

    pub fn oam_addr(&self) -> u8 {
        self.oam_addr
    }

    pub fn nmi_occurred(&self) -> bool {
        self.nmi_occurred
    }

    pub fn sprite_count(&self) -> usize {
        self.sprite_count
    }

    pub fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    pub fn debug_ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn debug_mask(&self) -> u8 {
        self.mask
    }

    pub fn debug_status(&self) -> u8 {
        self.status_bits()
    }

    pub fn debug_peek_nametable(&self, index: usize) -> u8 {
        self.nametables[index % self.nametables.len()]
    }

    pub fn debug_peek_palette(&self, index: usize) -> u8 {
        self.palette[index % self.palette.len()]
    }

    pub fn debug_peek_oam(&self, index: usize) -> u8 {
        self.oam[index % self.oam.len()]
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    pub fn cpu_read_register(&mut self, addr: u16, host: &mut dyn PpuHost) -> u8 {
        match 0x2000 | (addr & 0x0007) {
            0x2002 => self.read_status(host),
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => self.read_data(host),
            _ => self.register_latch,
        }
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, host: &mut dyn PpuHost) {
        self.debug.register_writes = self.debug.register_writes.wrapping_add(1);
        match 0x2000 | (addr & 0x0007) {
            0x2000 => self.write_control(value, host),
            0x2001 => self.write_mask(value),
            0x2002 => self.register_latch = value,
            0x2003 => self.write_oam_addr(value),
            0x2004 => {
                self.register_latch = value;
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => self.write_scroll(value),
            0x2006 => self.write_address(value),
            _ => {
                self.register_latch = value;
                self.ppu_write(self.v, value, host);
                self.increment_vram_addr();
            }
        }
    }

    // The page byte written to 0x4014 stays on the register latch.
    pub fn write_oam_dma(&mut self, page: u8, bytes: &[u8; 256]) {
        self.register_latch = page;
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    pub fn step(&mut self, host: &mut dyn PpuHost) {
        self.debug.ticks = self.debug.ticks.wrapping_add(1);
        self.tick(host);

        let rendering_enabled = self.rendering_enabled();
        let pre_line = self.scanline == PRE_RENDER_LINE;
        let visible_line = self.scanline < FRAME_HEIGHT as u16;
        let render_line = pre_line || visible_line;
        let visible_cycle = (1..=256).contains(&self.cycle);
        let fetch_cycle = visible_cycle || (321..=336).contains(&self.cycle);

        if rendering_enabled {
            if visible_line && visible_cycle {
                self.render_pixel(host);
            }

            if render_line && fetch_cycle {
                self.tile_data <<= 4;
                match self.cycle % 8 {
                    1 => self.fetch_nametable_byte(host),
                    3 => self.fetch_attribute_byte(host),
                    5 => self.low_tile_byte = self.fetch_tile_row(host, 0),
                    7 => self.high_tile_byte = self.fetch_tile_row(host, 8),
                    0 => self.store_tile_data(),
                    _ => {}
                }
            }

            if pre_line && (280..=304).contains(&self.cycle) {
                self.copy_vertical_bits();
            }

            if render_line {
                if fetch_cycle && self.cycle % 8 == 0 {
                    self.increment_coarse_x();
                }
                if self.cycle == 256 {
                    self.increment_y();
                }
                if self.cycle == 257 {
                    self.copy_horizontal_bits();
                }
            }

            if self.cycle == 257 {
                if visible_line {
                    self.evaluate_sprites(host);
                } else {
                    self.sprite_count = 0;
                }
            }
        }

        if self.scanline == VBLANK_LINE && self.cycle == 1 {
            self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
            self.nmi_occurred = true;
            self.nmi_change(host);
            host.present_frame();
        }

        if pre_line && self.cycle == 1 {
            self.nmi_occurred = false;
            self.nmi_change(host);
            self.sprite_zero_hit = false;
            self.sprite_overflow = false;
        }
    }

    fn tick(&mut self, host: &mut dyn PpuHost) {
        if self.nmi_delay > 0 {
            self.nmi_delay -= 1;
            if self.nmi_delay == 0 && self.nmi_output && self.nmi_occurred {
                self.raise_nmi(host);
            }
        }

        // NTSC drops the last pre-render dot on alternate rendered frames.
        if self.rendering_enabled()
            && self.even_frame
            && self.scanline == PRE_RENDER_LINE
            && self.cycle == LAST_CYCLE - 1
        {
            self.cycle = 0;
            self.scanline = 0;
            self.even_frame = !self.even_frame;
            return;
        }

        self.cycle += 1;
        if self.cycle > LAST_CYCLE {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline > PRE_RENDER_LINE {
                self.scanline = 0;
                self.even_frame = !self.even_frame;
            }
        }
    }

    fn status_bits(&self) -> u8 {
        let mut status = self.register_latch & 0x1F;
        if self.sprite_overflow {
            status |= STATUS_SPRITE_OVERFLOW;
        }
        if self.sprite_zero_hit {
            status |= STATUS_SPRITE_ZERO_HIT;
        }
        if self.nmi_occurred {
            status |= STATUS_VBLANK;
        }
        status
    }

    fn read_status(&mut self, host: &mut dyn PpuHost) -> u8 {
        self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
        let status = self.status_bits();
        self.nmi_occurred = false;
        self.nmi_change(host);
        self.write_toggle = false;
        status
    }

    fn write_control(&mut self, value: u8, host: &mut dyn PpuHost) {
        self.register_latch = value;
        self.ctrl = value;
        self.nmi_output = (value & CTRL_NMI_ENABLE) != 0;
        self.nmi_change(host);
        self.t = (self.t & !0x0C00) | (((value & CTRL_NAMETABLE_SELECT) as u16) << 10);
    }

    fn write_mask(&mut self, value: u8) {
        self.register_latch = value;
        self.mask = value;
    }

    fn write_oam_addr(&mut self, value: u8) {
        self.register_latch = value;
        self.oam_addr = value;
    }

    fn write_scroll(&mut self, value: u8) {
        self.register_latch = value;
        if !self.write_toggle {
            self.t = (self.t & !0x001F) | ((value as u16) >> 3);
            self.fine_x = value & 0x07;
        } else {
            self.t = (self.t & !0x7000) | (((value & 0x07) as u16) << 12);
            self.t = (self.t & !0x03E0) | (((value & 0xF8) as u16) << 2);
        }
        self.write_toggle = !self.write_toggle;
    }

    fn write_address(&mut self, value: u8) {
        self.register_latch = value;
        if !self.write_toggle {
            // Bit 14 is cleared along with the high byte.
            self.t = (self.t & 0x00FF) | (((value & 0x3F) as u16) << 8);
        } else {
            self.t = (self.t & 0x7F00) | value as u16;
            self.v = self.t;
        }
        self.write_toggle = !self.write_toggle;
    }

    fn read_data(&mut self, host: &mut dyn PpuHost) -> u8 {
        let addr = self.v & 0x3FFF;
        let value = self.ppu_read(addr, host);
        let result = if addr < 0x3F00 {
            std::mem::replace(&mut self.read_buffer, value)
        } else {
            self.read_buffer = self.ppu_read(addr - 0x1000, host);
            value
        };
        self.increment_vram_addr();
        result
    }

    fn increment_vram_addr(&mut self) {
        let step = if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            32
        } else {
            1
        };
        self.v = self.v.wrapping_add(step) & VRAM_ADDR_MASK;
    }

    fn nmi_change(&mut self, host: &mut dyn PpuHost) {
        let nmi = self.nmi_output && self.nmi_occurred;
        if nmi && !self.nmi_previous {
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
            self.nmi_delay = self.nmi_delay_cycles;
            if self.nmi_delay == 0 {
                self.raise_nmi(host);
            }
        }
        self.nmi_previous = nmi;
    }

    fn raise_nmi(&mut self, host: &mut dyn PpuHost) {
        self.debug.nmi_raised = self.debug.nmi_raised.wrapping_add(1);
        host.raise_nmi();
    }

    fn fetch_nametable_byte(&mut self, host: &mut dyn PpuHost) {
        self.nametable_byte = self.ppu_read(0x2000 | (self.v & 0x0FFF), host);
    }

    fn fetch_attribute_byte(&mut self, host: &mut dyn PpuHost) {
        let v = self.v;
        let addr = 0x23C0 | (v & 0x0C00) | ((v >> 4) & 0x38) | ((v >> 2) & 0x07);
        let shift = ((v >> 4) & 0x04) | (v & 0x02);
        self.attribute_byte = ((self.ppu_read(addr, host) >> shift) & 0x03) << 2;
    }

    fn fetch_tile_row(&mut self, host: &mut dyn PpuHost, plane: u16) -> u8 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        let addr = table + (self.nametable_byte as u16) * 16 + fine_y + plane;
        self.ppu_read(addr, host)
    }

    fn store_tile_data(&mut self) {
        let mut data = 0u32;
        for _ in 0..8 {
            let p1 = (self.low_tile_byte & 0x80) >> 7;
            let p2 = (self.high_tile_byte & 0x80) >> 6;
            self.low_tile_byte <<= 1;
            self.high_tile_byte <<= 1;
            data = (data << 4) | (self.attribute_byte | p1 | p2) as u32;
        }
        self.tile_data |= data as u64;
    }

    fn background_pixel(&self) -> u8 {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return 0;
        }
        let data = ((self.tile_data >> 32) as u32) >> ((7 - self.fine_x as u32) * 4);
        (data & 0x0F) as u8
    }

    fn sprite_pixel(&self) -> Option<(usize, u8)> {
        if (self.mask & MASK_SHOW_SPRITES) == 0 {
            return None;
        }
        let dot = self.cycle as i32 - 1;
        (0..self.sprite_count).find_map(|slot| {
            let offset = dot - self.sprite_positions[slot] as i32;
            if !(0..=7).contains(&offset) {
                return None;
            }
            let pixel = ((self.sprite_patterns[slot] >> ((7 - offset) * 4)) & 0x0F) as u8;
            (pixel % 4 != 0).then_some((slot, pixel))
        })
    }

    fn render_pixel(&mut self, host: &mut dyn PpuHost) {
        let x = (self.cycle - 1) as u8;
        let y = self.scanline as u8;

        let mut background = self.background_pixel();
        let mut sprite = self.sprite_pixel();
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            background = 0;
        }
        if x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0 {
            sprite = None;
        }

        let opaque_background = background % 4 != 0;
        let palette_index = match (opaque_background, sprite) {
            (false, None) => 0,
            (false, Some((_, pixel))) => pixel | 0x10,
            (true, None) => background,
            (true, Some((slot, pixel))) => {
                if self.sprite_indexes[slot] == 0 && x < 255 {
                    if !self.sprite_zero_hit {
                        self.debug.sprite0_hit_events =
                            self.debug.sprite0_hit_events.wrapping_add(1);
                        self.debug.sprite0_hit_last_scanline = self.scanline;
                        self.debug.sprite0_hit_last_cycle = self.cycle;
                    }
                    self.sprite_zero_hit = true;
                }
                if self.sprite_priorities[slot] == 0 {
                    pixel | 0x10
                } else {
                    background
                }
            }
        };

        let mut color = self.palette[palette_slot(palette_index as u16)] & 0x3F;
        if (self.mask & MASK_GRAYSCALE) != 0 {
            color &= 0x30;
        }
        host.write_pixel(x, y, palette_index, color);
    }

    fn evaluate_sprites(&mut self, host: &mut dyn PpuHost) {
        let height = self.sprite_height();
        let mut count = 0usize;
        for index in 0..64 {
            let y = self.oam[index * 4] as i32;
            let row = self.scanline as i32 - y;
            if !(0..height).contains(&row) {
                continue;
            }
            if count < MAX_SPRITES_PER_LINE {
                let attributes = self.oam[index * 4 + 2];
                self.sprite_patterns[count] = self.fetch_sprite_pattern(host, index, row);
                self.sprite_positions[count] = self.oam[index * 4 + 3];
                self.sprite_priorities[count] = (attributes >> 5) & 0x01;
                self.sprite_indexes[count] = index as u8;
            }
            count += 1;
        }

        if count > MAX_SPRITES_PER_LINE {
            count = MAX_SPRITES_PER_LINE;
            if !self.sprite_overflow {
                self.debug.sprite_overflow_events = self.debug.sprite_overflow_events.wrapping_add(1);
                self.debug.sprite_overflow_last_scanline = self.scanline;
            }
            self.sprite_overflow = true;
        }
        self.sprite_count = count;
    }

    fn sprite_height(&self) -> i32 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    // Eight 4-bit pixels, leftmost in the top nibble.
    fn fetch_sprite_pattern(&mut self, host: &mut dyn PpuHost, index: usize, row: i32) -> u32 {
        let tile = self.oam[index * 4 + 1];
        let attributes = self.oam[index * 4 + 2];
        let flip_vertical = (attributes & 0x80) != 0;
        let flip_horizontal = (attributes & 0x40) != 0;

        let (table, tile, row) = if self.sprite_height() == 8 {
            let row = if flip_vertical { 7 - row } else { row };
            let table = if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                0x1000
            } else {
                0x0000
            };
            (table, tile as u16, row as u16)
        } else {
            let mut row = if flip_vertical { 15 - row } else { row };
            let table = ((tile & 0x01) as u16) * 0x1000;
            let mut tile = (tile & 0xFE) as u16;
            if row > 7 {
                tile += 1;
                row -= 8;
            }
            (table, tile, row as u16)
        };

        let addr = table + tile * 16 + row;
        let mut low = self.ppu_read(addr, host);
        let mut high = self.ppu_read(addr + 8, host);
        let palette = (attributes & 0x03) << 2;

        let mut data = 0u32;
        for _ in 0..8 {
            let (p1, p2) = if flip_horizontal {
                let bits = (low & 0x01, (high & 0x01) << 1);
                low >>= 1;
                high >>= 1;
                bits
            } else {
                let bits = ((low & 0x80) >> 7, (high & 0x80) >> 6);
                low <<= 1;
                high <<= 1;
                bits
            };
            data = (data << 4) | (palette | p1 | p2) as u32;
        }
        data
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v += 1;
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v += 0x1000;
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn ppu_read(&mut self, addr: u16, host: &mut dyn PpuHost) -> u8 {
        let addr = addr & 0x3FFF;
        self.debug.last_read_addr = addr;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.pattern_reads = self.debug.pattern_reads.wrapping_add(1);
                host.read_pattern(addr)
            }
            0x2000..=0x3EFF => {
                self.debug.nametable_reads = self.debug.nametable_reads.wrapping_add(1);
                self.nametables[nametable_index(addr, host.mirror_mode())]
            }
            _ => {
                self.debug.palette_reads = self.debug.palette_reads.wrapping_add(1);
                self.palette[palette_slot(addr)]
            }
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, host: &mut dyn PpuHost) {
        let addr = addr & 0x3FFF;
        self.debug.last_write_addr = addr;
        match addr {
            0x0000..=0x1FFF => {
                self.debug.pattern_writes = self.debug.pattern_writes.wrapping_add(1);
                host.write_pattern(addr, value);
            }
            0x2000..=0x3EFF => {
                self.debug.nametable_writes = self.debug.nametable_writes.wrapping_add(1);
                self.nametables[nametable_index(addr, host.mirror_mode())] = value;
            }
            _ => {
                self.debug.palette_writes = self.debug.palette_writes.wrapping_add(1);
                self.palette[palette_slot(addr)] = value;
            }
        }
    }

    pub fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new();
        w.put_u16(self.cycle);
        w.put_u16(self.scanline);
        w.put_bytes(&self.palette);
        w.put_bytes(&self.nametables);
        w.put_bytes(&self.oam);
        w.put_u16(self.v);
        w.put_u16(self.t);
        w.put_u8(self.fine_x);
        w.put_bool(self.write_toggle);
        w.put_bool(self.even_frame);
        w.put_bool(self.nmi_occurred);
        w.put_bool(self.nmi_output);
        w.put_bool(self.nmi_previous);
        w.put_u8(self.nmi_delay);
        w.put_u8(self.nametable_byte);
        w.put_u8(self.attribute_byte);
        w.put_u8(self.low_tile_byte);
        w.put_u8(self.high_tile_byte);
        w.put_u64(self.tile_data);
        w.put_u8(self.sprite_count as u8);
        for pattern in self.sprite_patterns {
            w.put_u32(pattern);
        }
        w.put_bytes(&self.sprite_positions);
        w.put_bytes(&self.sprite_priorities);
        w.put_bytes(&self.sprite_indexes);
        w.put_u8(self.ctrl);
        w.put_u8(self.mask);
        w.put_bool(self.sprite_zero_hit);
        w.put_bool(self.sprite_overflow);
        w.put_u8(self.oam_addr);
        w.put_u8(self.read_buffer);
        w.put_u8(self.register_latch);
        w.seal(SectionKind::Ppu)
    }

    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let mut r = SnapshotReader::open(bytes, SectionKind::Ppu)?;
        let mut next = self.clone();

        next.cycle = r.get_u16_max("cycle", LAST_CYCLE)?;
        next.scanline = r.get_u16_max("scanline", PRE_RENDER_LINE)?;
        next.palette = r.get_array()?;
        next.nametables = r.get_array()?;
        next.oam = r.get_array()?;
        next.v = r.get_u16_max("v", VRAM_ADDR_MASK)?;
        next.t = r.get_u16_max("t", VRAM_ADDR_MASK)?;
        next.fine_x = r.get_u8_max("fine_x", 7)?;
        next.write_toggle = r.get_bool("write_toggle")?;
        next.even_frame = r.get_bool("even_frame")?;
        next.nmi_occurred = r.get_bool("nmi_occurred")?;
        next.nmi_output = r.get_bool("nmi_output")?;
        next.nmi_previous = r.get_bool("nmi_previous")?;
        next.nmi_delay = r.get_u8()?;
        next.nametable_byte = r.get_u8()?;
        next.attribute_byte = r.get_u8_max("attribute_byte", 0x0C)?;
        // Stored pre-shifted by two, so the low bits are always clear.
        if next.attribute_byte & 0x03 != 0 {
            return Err(SnapshotError::InvalidField {
                field: "attribute_byte",
                value: next.attribute_byte as u64,
            });
        }
        next.low_tile_byte = r.get_u8()?;
        next.high_tile_byte = r.get_u8()?;
        next.tile_data = r.get_u64()?;
        next.sprite_count = r.get_u8_max("sprite_count", MAX_SPRITES_PER_LINE as u8)? as usize;
        for pattern in next.sprite_patterns.iter_mut() {
            *pattern = r.get_u32()?;
        }
        next.sprite_positions = r.get_array()?;
        for priority in next.sprite_priorities.iter_mut() {
            *priority = r.get_u8_max("sprite_priority", 1)?;
        }
        for index in next.sprite_indexes.iter_mut() {
            *index = r.get_u8_max("sprite_index", 63)?;
        }
        next.ctrl = r.get_u8()?;
        next.mask = r.get_u8()?;
        next.sprite_zero_hit = r.get_bool("sprite_zero_hit")?;
        next.sprite_overflow = r.get_bool("sprite_overflow")?;
        next.oam_addr = r.get_u8()?;
        next.read_buffer = r.get_u8()?;
        next.register_latch = r.get_u8()?;
        r.finish()?;

        *self = next;
        Ok(())
    }
}

// Sprite backdrop entries 0x10/0x14/0x18/0x1C alias the background ones.
fn palette_slot(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index >= 16 && index % 4 == 0 {
        index - 16
    } else {
        index
    }
}

// Four-screen boards need cartridge VRAM, which is not modelled; they fall
// back to the vertical layout.
fn nametable_index(addr: u16, mirror_mode: MirrorMode) -> usize {
    let index = ((addr - 0x2000) % 0x1000) as usize;
    let table = index / 0x400;
    let offset = index % 0x400;

    let mapped_table = match mirror_mode {
        MirrorMode::Horizontal => table / 2,
        MirrorMode::Vertical | MirrorMode::FourScreen => table & 1,
        MirrorMode::Single0 => 0,
        MirrorMode::Single1 => 1,
    };
    mapped_table * 0x400 + offset
}
