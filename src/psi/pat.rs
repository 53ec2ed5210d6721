use crate::psi::section::SectionReader;

/// ─────────── PAT ───────────
#[derive(Clone)]
pub struct PatSection {
    pub version:      u8,
    pub current_next: bool,
    pub programs:     Vec<PatEntry>,
}

#[derive(Clone)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid:        u16,
}

/// Parses a PAT from an assembled section. Program number 0 entries
/// (network PID) are skipped.
pub fn parse_pat(sec: &SectionReader) -> anyhow::Result<PatSection> {
    if sec.table_id != 0x00 {
        anyhow::bail!("not PAT");
    }

    let mut idx = 0;
    let mut programs = Vec::new();
    while idx + 4 <= sec.body.len() {
        let pn = u16::from_be_bytes(sec.body[idx..idx + 2].try_into()?);
        let pid = (((sec.body[idx + 2] & 0x1F) as u16) << 8) | (sec.body[idx + 3] as u16);
        idx += 4;
        if pn != 0 {
            programs.push(PatEntry { program_number: pn, pmt_pid: pid });
        }
    }
    Ok(PatSection { version: sec.version, current_next: sec.current_next, programs })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Same golden section as in section.rs: program 0x0084 at PMT pid 0x0084.
    const PAT_SECTION: [u8; 16] = [
        0x00, 0xB0, 0x0D, 0x80, 0x08, 0xC1, 0x00, 0x00, 0x00, 0x84, 0xE0, 0x84, 0xE7, 0x01, 0x8B,
        0x94,
    ];

    #[test]
    fn parses_single_program() {
        let sec = SectionReader::from_section(&PAT_SECTION).unwrap();
        let pat = parse_pat(&sec).unwrap();
        assert_eq!(pat.version, 0);
        assert_eq!(pat.programs.len(), 1);
        assert_eq!(pat.programs[0].program_number, 0x0084);
        assert_eq!(pat.programs[0].pmt_pid, 0x0084);
    }
}
