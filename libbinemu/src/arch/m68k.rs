//! M68K descriptor. No OS binding yet.

use crate::arch::ArchDescriptor;

pub mod regs {
    use crate::cpu::RegId;

    pub const D0: RegId = 1;
    pub const D1: RegId = 2;
    pub const D2: RegId = 3;
    pub const D3: RegId = 4;
    pub const D4: RegId = 5;
    pub const D5: RegId = 6;
    pub const D6: RegId = 7;
    pub const D7: RegId = 8;
    pub const A0: RegId = 9;
    pub const A1: RegId = 10;
    pub const A2: RegId = 11;
    pub const A3: RegId = 12;
    pub const A4: RegId = 13;
    pub const A5: RegId = 14;
    pub const A6: RegId = 15;
    pub const A7: RegId = 16;
    pub const PC: RegId = 17;
}

pub static ARCH: ArchDescriptor = ArchDescriptor {
    name: "m68k",
    bits: 32,
    pc: regs::PC,
    sp: regs::A7,
    regs: &[
        ("d0", regs::D0),
        ("d1", regs::D1),
        ("d2", regs::D2),
        ("d3", regs::D3),
        ("d4", regs::D4),
        ("d5", regs::D5),
        ("d6", regs::D6),
        ("d7", regs::D7),
        ("a0", regs::A0),
        ("a1", regs::A1),
        ("a2", regs::A2),
        ("a3", regs::A3),
        ("a4", regs::A4),
        ("a5", regs::A5),
        ("a6", regs::A6),
        ("sp", regs::A7),
        ("pc", regs::PC),
    ],
    default_regs: &[
        "d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7", "a0", "a1", "a2", "a3", "a4", "a5", "a6",
    ],
    os: &[],
};
