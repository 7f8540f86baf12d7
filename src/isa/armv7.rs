//! ARMv7-A (A32) encodings used for relocation and trampoline fix-up.
//!
//! Direct calls are emitted as a four instruction, pc-relative sequence:
//!
//! ```text
//! movw ip, #:lower16:disp
//! movt ip, #:upper16:disp
//! add  ip, pc, ip          ; pc reads as site + 16 here
//! blx  ip
//! ```
//!
//! Jumps use a plain `B` with a signed 24-bit word offset.

/// NOP (hint form)
pub const NOP: u32 = 0xE320F000;
/// BX LR
pub const RET: u32 = 0xE12FFF1E;
/// ADD ip, pc, ip
pub const ADD_IP_PC_IP: u32 = 0xE08FC00C;
/// BLX ip
pub const BLX_IP: u32 = 0xE12FFF3C;

/// Intra-procedure scratch register.
pub const IP: u32 = 12;

/// PC bias: reading pc yields the instruction address plus 8.
const PC_BIAS: i64 = 8;

/// MOVW Rd, #imm16
pub fn movw(rd: u32, imm16: u16) -> u32 {
    // cond 0011 0000 iiii dddd iiii iiii iiii
    let imm = imm16 as u32;
    0xE3000000 | ((imm >> 12) << 16) | ((rd & 0xF) << 12) | (imm & 0xFFF)
}

/// MOVT Rd, #imm16
pub fn movt(rd: u32, imm16: u16) -> u32 {
    let imm = imm16 as u32;
    0xE3400000 | ((imm >> 12) << 16) | ((rd & 0xF) << 12) | (imm & 0xFFF)
}

fn movw_movt_imm(inst: u32) -> u16 {
    (((inst >> 16) & 0xF) << 12 | (inst & 0xFFF)) as u16
}

/// Length of the movw/movt/add/blx call sequence.
pub const CALL_SEQUENCE_SIZE: usize = 16;

/// Encode the call sequence for a byte displacement from the first instruction.
pub fn encode_call_sequence(disp: i64) -> Option<[u32; 4]> {
    let rel = disp - 2 * PC_BIAS;
    let rel = i32::try_from(rel).ok()? as u32;
    Some([
        movw(IP, rel as u16),
        movt(IP, (rel >> 16) as u16),
        ADD_IP_PC_IP,
        BLX_IP,
    ])
}

/// Decode the call sequence back into a byte displacement from its first instruction.
pub fn decode_call_sequence(words: [u32; 4]) -> Option<i64> {
    let movw_ok = words[0] & 0xFFF0F000 == movw(IP, 0);
    let movt_ok = words[1] & 0xFFF0F000 == movt(IP, 0);
    if !movw_ok || !movt_ok || words[2] != ADD_IP_PC_IP || words[3] != BLX_IP {
        return None;
    }
    let rel = (movw_movt_imm(words[0]) as u32) | ((movw_movt_imm(words[1]) as u32) << 16);
    Some(rel as i32 as i64 + 2 * PC_BIAS)
}

/// Encode B (or BL when `link`) with a byte displacement from the instruction.
pub fn encode_branch(link: bool, disp: i64) -> Option<u32> {
    let rel = disp - PC_BIAS;
    if rel % 4 != 0 {
        return None;
    }
    let words = rel / 4;
    if !(-(1 << 23)..(1 << 23)).contains(&words) {
        return None;
    }
    let opcode = if link { 0xEB000000 } else { 0xEA000000 };
    Some(opcode | ((words as u32) & 0x00FFFFFF))
}

/// Decode an unconditional B/BL into (is_link, byte displacement).
pub fn decode_branch(inst: u32) -> Option<(bool, i64)> {
    let link = match inst & 0xFF000000 {
        0xEA000000 => false,
        0xEB000000 => true,
        _ => return None,
    };
    let imm = ((inst & 0x00FFFFFF) << 8) as i32 >> 8;
    Some((link, imm as i64 * 4 + PC_BIAS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movw_movt() {
        // movw ip, #0x1234 ; movt ip, #0xabcd
        assert_eq!(movw(IP, 0x1234), 0xE301C234);
        assert_eq!(movt(IP, 0xABCD), 0xE34ACBCD);
    }

    #[test]
    fn test_branch_self_loop() {
        // `b .` is 0xEAFFFFFE
        assert_eq!(encode_branch(false, 0), Some(0xEAFFFFFE));
        assert_eq!(decode_branch(0xEAFFFFFE), Some((false, 0)));
        assert_eq!(decode_branch(0xEB000010), Some((true, 0x48)));
        assert_eq!(encode_branch(false, 2), None);
    }

    #[test]
    fn test_call_sequence() {
        for disp in [-0x1000, -16, 0, 16, 0x12_3450, i32::MAX as i64 / 2] {
            let words = encode_call_sequence(disp).unwrap();
            assert_eq!(decode_call_sequence(words), Some(disp));
        }
        let mut words = encode_call_sequence(32).unwrap();
        words[3] = NOP;
        assert_eq!(decode_call_sequence(words), None);
    }
}
