//! Packet-level PAT/PMT parsing: assembles sections across TS packets,
//! validates CRCs and reconstructs the channel a recording describes.

use log::{debug, error};

use crate::channel::{AudioTrack, ChannelDescriptor, SubtitleTrack};
use crate::psi::pat::parse_pat;
use crate::psi::pmt::{parse_pmt, EsDescriptor};
use crate::psi::section::{section_total_len, SectionReader};
use crate::ts;

const MAX_SECTION_SIZE: usize = 4096;

/// Parses PAT and PMT packets out of a TS stream.
///
/// Feed packets in stream order; once a PMT section has been assembled
/// and CRC-checked, [`channel`](Self::channel) exposes the parsed
/// structure. Sections repeating the last accepted version are skipped.
#[derive(Default)]
pub struct PatPmtParser {
    pmt_pid:     Option<u16>,
    pat_version: Option<u8>,
    pmt_version: Option<u8>,
    pmt_buf:     Vec<u8>,
    channel:     Option<ChannelDescriptor>,
}

impl PatPmtParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Routes every 188-byte packet in `data`; packets with other PIDs
    /// are ignored.
    pub fn feed(&mut self, data: &[u8]) {
        for packet in data.chunks_exact(ts::TS_SIZE) {
            if packet[0] != ts::TS_SYNC_BYTE || !ts::ts_has_payload(packet) {
                continue;
            }
            let pid = ts::ts_pid(packet);
            if pid == 0 {
                self.parse_pat_packet(packet);
            } else if Some(pid) == self.pmt_pid {
                self.parse_pmt_packet(packet);
            }
        }
    }

    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    /// The channel described by the last accepted PMT.
    pub fn channel(&self) -> Option<&ChannelDescriptor> {
        self.channel.as_ref()
    }

    pub fn versions(&self) -> (Option<u8>, Option<u8>) {
        (self.pat_version, self.pmt_version)
    }

    fn parse_pat_packet(&mut self, packet: &[u8]) {
        if !ts::ts_payload_start(packet) {
            return; // the PAT is assumed to fit into a single TS packet
        }
        let payload = &packet[ts::ts_payload_offset(packet)..];
        let sec = match SectionReader::from_payload(payload) {
            Ok(sec) => sec,
            Err(e) => {
                error!("can't parse PAT: {e}");
                return;
            }
        };
        if self.pat_version == Some(sec.version) {
            return;
        }
        match parse_pat(&sec) {
            Ok(pat) => {
                if let Some(entry) = pat.programs.first() {
                    debug!(
                        "PAT v{}: program {} on PMT pid {}",
                        pat.version, entry.program_number, entry.pmt_pid
                    );
                    self.pmt_pid = Some(entry.pmt_pid);
                }
                self.pat_version = Some(sec.version);
            }
            Err(e) => error!("can't parse PAT: {e}"),
        }
    }

    fn parse_pmt_packet(&mut self, packet: &[u8]) {
        let payload = &packet[ts::ts_payload_offset(packet)..];
        if ts::ts_payload_start(packet) {
            // a new section starts: reset the assembly buffer
            self.pmt_buf.clear();
            if payload.is_empty() {
                return;
            }
            let pointer = payload[0] as usize;
            if payload.len() < 1 + pointer {
                return;
            }
            self.pmt_buf.extend_from_slice(&payload[1 + pointer..]);
        } else if !self.pmt_buf.is_empty() {
            if self.pmt_buf.len() + payload.len() > MAX_SECTION_SIZE {
                error!("PMT section length too big ({} bytes)", self.pmt_buf.len() + payload.len());
                self.pmt_buf.clear();
                return;
            }
            self.pmt_buf.extend_from_slice(payload);
        } else {
            return; // fragment of a broken section
        }

        match section_total_len(&self.pmt_buf) {
            Some(total) if total <= self.pmt_buf.len() => {}
            _ => return, // more packets to come
        }

        let sec = match SectionReader::from_section(&self.pmt_buf) {
            Ok(sec) => sec,
            Err(e) => {
                error!("can't parse PMT: {e}");
                self.pmt_buf.clear();
                return;
            }
        };
        if self.pmt_version == Some(sec.version) {
            self.pmt_buf.clear();
            return;
        }
        match parse_pmt(&sec) {
            Ok(pmt) => {
                self.pmt_version = Some(pmt.version);
                self.channel = Some(channel_from_pmt(&pmt));
                debug!("PMT v{}: {} streams", pmt.version, pmt.streams.len());
            }
            Err(e) => error!("can't parse PMT: {e}"),
        }
        self.pmt_buf.clear();
    }
}

fn channel_from_pmt(pmt: &crate::psi::pmt::PmtSection) -> ChannelDescriptor {
    let mut ch = ChannelDescriptor::default();
    for stream in &pmt.streams {
        let pid = stream.elementary_pid;
        match stream.stream_type {
            0x01 | 0x02 | 0x1B => {
                ch.vpid = pid;
                ch.vtype = stream.stream_type;
                ch.ppid = pmt.pcr_pid;
            }
            0x04 => {
                let lang = iso639_lang(&stream.descriptors);
                ch.apids.push(AudioTrack { pid, lang });
            }
            0x06 => {
                let mut is_ac3 = false;
                let mut sub_lang = None;
                let mut teletext = None;
                for d in &stream.descriptors {
                    match d {
                        EsDescriptor::Ac3 => is_ac3 = true,
                        EsDescriptor::Subtitling { lang } => sub_lang = Some(lang.clone()),
                        EsDescriptor::Teletext { pages } => teletext = Some(pages.clone()),
                        _ => {}
                    }
                }
                if is_ac3 {
                    ch.dpids.push(AudioTrack { pid, lang: iso639_lang(&stream.descriptors) });
                } else if let Some(lang) = sub_lang {
                    ch.spids.push(SubtitleTrack { pid, lang });
                } else if let Some(pages) = teletext {
                    ch.tpid = pid;
                    ch.teletext_pages = pages;
                }
            }
            _ => {}
        }
    }
    ch
}

fn iso639_lang(descriptors: &[EsDescriptor]) -> String {
    descriptors
        .iter()
        .find_map(|d| match d {
            EsDescriptor::Iso639Language { lang } => Some(lang.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AudioTrack, SubtitleTrack, TeletextPage};
    use crate::psi::generator::PatPmtGenerator;

    fn full_channel() -> ChannelDescriptor {
        let mut ch = ChannelDescriptor { vpid: 100, vtype: 0x02, ppid: 100, ..Default::default() };
        ch.apids.push(AudioTrack { pid: 101, lang: "deu".into() });
        ch.apids.push(AudioTrack { pid: 102, lang: "eng".into() });
        ch.dpids.push(AudioTrack { pid: 103, lang: "deu".into() });
        ch.spids.push(SubtitleTrack { pid: 104, lang: "deu".into() });
        ch.tpid = 105;
        ch.teletext_pages.push(TeletextPage {
            lang: "deu".into(),
            teletext_type: 1,
            magazine: 1,
            page: 0,
        });
        ch
    }

    fn feed_tables(parser: &mut PatPmtParser, gen: &mut PatPmtGenerator) {
        parser.feed(gen.next_pat());
        let mut i = 0;
        while let Some(pmt) = gen.next_pmt(i) {
            let pmt = pmt.to_vec();
            parser.feed(&pmt);
            i += 1;
        }
    }

    #[test]
    fn roundtrip_generate_parse() {
        let ch = full_channel();
        let mut gen = PatPmtGenerator::new(&ch);
        let mut parser = PatPmtParser::new();
        feed_tables(&mut parser, &mut gen);
        assert_eq!(parser.pmt_pid(), Some(gen.pmt_pid()));
        assert_eq!(parser.channel(), Some(&ch));
    }

    #[test]
    fn roundtrip_audio_only() {
        let mut ch = ChannelDescriptor::default();
        ch.dpids.push(AudioTrack { pid: 200, lang: "fra".into() });
        let mut gen = PatPmtGenerator::new(&ch);
        let mut parser = PatPmtParser::new();
        feed_tables(&mut parser, &mut gen);
        assert_eq!(parser.channel(), Some(&ch));
    }

    #[test]
    fn ignores_repeated_version() {
        let ch = full_channel();
        let mut gen = PatPmtGenerator::new(&ch);
        let mut parser = PatPmtParser::new();
        feed_tables(&mut parser, &mut gen);
        let (pat_v, pmt_v) = parser.versions();
        // same tables again: nothing changes
        feed_tables(&mut parser, &mut gen);
        assert_eq!(parser.versions(), (pat_v, pmt_v));

        // regenerated tables carry the next version and are accepted
        gen.set_channel(&ch);
        feed_tables(&mut parser, &mut gen);
        let (pat_v2, pmt_v2) = parser.versions();
        assert_eq!(pat_v2, pat_v.map(|v| (v + 1) & 0x1F));
        assert_eq!(pmt_v2, pmt_v.map(|v| (v + 1) & 0x1F));
    }

    #[test]
    fn corrupt_pmt_is_discarded() {
        let ch = full_channel();
        let mut gen = PatPmtGenerator::new(&ch);
        let mut parser = PatPmtParser::new();
        parser.feed(gen.next_pat());
        let mut pmt = gen.next_pmt(0).unwrap().to_vec();
        pmt[20] ^= 0xFF; // break the section body -> CRC mismatch
        parser.feed(&pmt);
        assert!(parser.channel().is_none());
    }

    #[test]
    fn multi_packet_pmt_assembles() {
        let mut ch = full_channel();
        for n in 0..30 {
            ch.apids.push(AudioTrack { pid: 300 + n, lang: "eng".into() });
        }
        let mut gen = PatPmtGenerator::new(&ch);
        let mut parser = PatPmtParser::new();
        feed_tables(&mut parser, &mut gen);
        assert_eq!(parser.channel(), Some(&ch));
    }
}
