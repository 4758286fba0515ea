use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha1::{Digest, Sha1};

use super::palette::NES_PALETTE;
use super::ppu::{FRAME_HEIGHT, FRAME_WIDTH};

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pixels: Vec<u8>,
    frames_presented: u64,
    frame_ready: bool,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        let mut pixels = vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4];
        for alpha in pixels.iter_mut().skip(3).step_by(4) {
            *alpha = 0xFF;
        }
        Self {
            pixels,
            frames_presented: 0,
            frame_ready: false,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn put_pixel(&mut self, x: u8, y: u8, color: u8) {
        let (x, y) = (x as usize, y as usize);
        if x >= FRAME_WIDTH || y >= FRAME_HEIGHT {
            return;
        }
        let rgb = NES_PALETTE[(color & 0x3F) as usize];
        let idx = (y * FRAME_WIDTH + x) * 4;
        self.pixels[idx..idx + 3].copy_from_slice(&rgb);
        self.pixels[idx + 3] = 0xFF;
    }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 4] {
        let idx = (y * FRAME_WIDTH + x) * 4;
        [
            self.pixels[idx],
            self.pixels[idx + 1],
            self.pixels[idx + 2],
            self.pixels[idx + 3],
        ]
    }

    pub fn present(&mut self) {
        self.frames_presented = self.frames_presented.wrapping_add(1);
        self.frame_ready = true;
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    pub fn digest(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&Sha1::digest(&self.pixels));
        out
    }

    pub fn digest_base64(&self) -> String {
        BASE64_STANDARD.encode(self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_pixel_converts_system_colour() {
        let mut frame = FrameBuffer::new();
        frame.put_pixel(3, 2, 0x30);
        assert_eq!(frame.pixel(3, 2), [0xEC, 0xEE, 0xEC, 0xFF]);
        // Upper bits are ignored.
        frame.put_pixel(0, 0, 0xC1);
        assert_eq!(frame.pixel(0, 0), [0x00, 0x1E, 0x74, 0xFF]);
        assert_eq!(frame.pixel(1, 0), [0, 0, 0, 0xFF]);
    }

    #[test]
    fn present_counts_frames_and_latches_ready() {
        let mut frame = FrameBuffer::new();
        assert!(!frame.take_frame_ready());
        frame.present();
        frame.present();
        assert_eq!(frame.frames_presented(), 2);
        assert!(frame.take_frame_ready());
        assert!(!frame.take_frame_ready());
    }

    #[test]
    fn digest_tracks_content() {
        let mut frame = FrameBuffer::new();
        let blank = frame.digest_base64();
        assert_eq!(blank, FrameBuffer::new().digest_base64());
        frame.put_pixel(255, 239, 0x16);
        assert_ne!(frame.digest_base64(), blank);
        assert_eq!(frame.digest_base64().len(), 28);
    }
}
