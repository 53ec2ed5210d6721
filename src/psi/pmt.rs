use crate::channel::TeletextPage;
use crate::psi::section::SectionReader;

/// Descriptor tags emitted and understood by this codec (ETSI EN 300 468
/// / ISO 13818-1).
pub const DESC_ISO639_LANGUAGE: u8 = 0x0A;
pub const DESC_TELETEXT: u8 = 0x56;
pub const DESC_SUBTITLING: u8 = 0x59;
pub const DESC_AC3: u8 = 0x6A;

/// ─────────── PMT ───────────
#[derive(Clone)]
pub struct PmtSection {
    pub version:        u8,
    pub program_number: u16,
    pub pcr_pid:        u16,
    pub streams:        Vec<StreamInfo>,
}

#[derive(Clone)]
pub struct StreamInfo {
    pub stream_type:    u8,
    pub elementary_pid: u16,
    pub descriptors:    Vec<EsDescriptor>,
}

/// The elementary-stream descriptors the recorder cares about; anything
/// else is carried as its bare tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EsDescriptor {
    Iso639Language { lang: String },
    Ac3,
    Subtitling { lang: String },
    Teletext { pages: Vec<TeletextPage> },
    Other { tag: u8 },
}

pub fn parse_pmt(sec: &SectionReader) -> anyhow::Result<PmtSection> {
    if sec.table_id != 0x02 {
        anyhow::bail!("not PMT");
    }
    let b = sec.body;
    if b.len() < 4 {
        anyhow::bail!("PMT body too short");
    }

    /* fixed header inside the body */
    let pcr_pid = (((b[0] & 0x1F) as u16) << 8) | (b[1] as u16);
    let prog_info_len = (((b[2] & 0x0F) as usize) << 8) | (b[3] as usize);
    let mut idx = 4 + prog_info_len; // skip program descriptors

    /* ES loop */
    let mut streams = Vec::new();
    while idx + 5 <= b.len() {
        let stype = b[idx];
        let pid = (((b[idx + 1] & 0x1F) as u16) << 8) | (b[idx + 2] as u16);
        let eslen = (((b[idx + 3] & 0x0F) as usize) << 8) | (b[idx + 4] as usize);
        idx += 5;
        if idx + eslen > b.len() {
            anyhow::bail!("ES info length past section");
        }
        let descriptors = parse_es_descriptors(&b[idx..idx + eslen]);
        streams.push(StreamInfo { stream_type: stype, elementary_pid: pid, descriptors });
        idx += eslen;
    }

    Ok(PmtSection {
        version: sec.version,
        program_number: sec.table_id_ext,
        pcr_pid,
        streams,
    })
}

fn parse_es_descriptors(mut d: &[u8]) -> Vec<EsDescriptor> {
    let mut out = Vec::new();
    while d.len() >= 2 {
        let tag = d[0];
        let len = d[1] as usize;
        if d.len() < 2 + len {
            break;
        }
        let body = &d[2..2 + len];
        match tag {
            DESC_ISO639_LANGUAGE if len >= 4 => {
                out.push(EsDescriptor::Iso639Language { lang: lang_code(&body[0..3]) });
            }
            DESC_AC3 => out.push(EsDescriptor::Ac3),
            DESC_SUBTITLING if len >= 8 => {
                out.push(EsDescriptor::Subtitling { lang: lang_code(&body[0..3]) });
            }
            DESC_TELETEXT => {
                let mut pages = Vec::new();
                for entry in body.chunks_exact(5) {
                    pages.push(TeletextPage {
                        lang: lang_code(&entry[0..3]),
                        teletext_type: entry[3] >> 3,
                        magazine: entry[3] & 0x07,
                        page: entry[4],
                    });
                }
                out.push(EsDescriptor::Teletext { pages });
            }
            _ => out.push(EsDescriptor::Other { tag }),
        }
        d = &d[2 + len..];
    }
    out
}

fn lang_code(b: &[u8]) -> String {
    String::from_utf8_lossy(b).into_owned()
}
