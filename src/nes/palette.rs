pub const NES_PALETTE: [[u8; 3]; 64] = [
    [0x54, 0x54, 0x54], [0x00, 0x1E, 0x74], [0x08, 0x10, 0x90], [0x30, 0x00, 0x88],
    [0x44, 0x00, 0x64], [0x5C, 0x00, 0x30], [0x54, 0x04, 0x00], [0x3C, 0x18, 0x00],
    [0x20, 0x2A, 0x00], [0x08, 0x3A, 0x00], [0x00, 0x40, 0x00], [0x00, 0x3C, 0x00],
    [0x00, 0x30, 0x2C], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0x98, 0x96, 0x98], [0x08, 0x4C, 0xC4], [0x30, 0x32, 0xEC], [0x5C, 0x1E, 0xE4],
    [0x88, 0x14, 0xB0], [0xA0, 0x14, 0x64], [0x98, 0x22, 0x20], [0x78, 0x3C, 0x00],
    [0x54, 0x5A, 0x00], [0x28, 0x72, 0x00], [0x08, 0x7C, 0x00], [0x00, 0x76, 0x28],
    [0x00, 0x66, 0x78], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0xEC, 0xEE, 0xEC], [0x3C, 0x7E, 0xEC], [0x5C, 0x5C, 0xEC], [0x88, 0x44, 0xEC],
    [0xB0, 0x2C, 0xEC], [0xE0, 0x28, 0xB0], [0xD8, 0x3C, 0x50], [0xC4, 0x54, 0x00],
    [0xAC, 0x70, 0x00], [0x80, 0x88, 0x00], [0x40, 0x9C, 0x30], [0x20, 0xA4, 0x58],
    [0x20, 0x9A, 0x88], [0x40, 0x40, 0x40], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
    [0xEC, 0xEE, 0xEC], [0xA8, 0xBC, 0xEC], [0xBC, 0xAC, 0xEC], [0xD4, 0xA0, 0xEC],
    [0xEC, 0x94, 0xEC], [0xEC, 0x90, 0xD4], [0xEC, 0x9C, 0xB4], [0xE4, 0xB0, 0x90],
    [0xDC, 0xC8, 0x78], [0xD4, 0xDC, 0x78], [0xB8, 0xEC, 0x98], [0xA8, 0xEC, 0xBC],
    [0xA0, 0xE4, 0xE4], [0xA0, 0xA0, 0xA0], [0x00, 0x00, 0x00], [0x00, 0x00, 0x00],
];
