//! PAT/PMT generation: self-describing tables prepended to every
//! independent frame of a recording.

use crc::{Crc, CRC_32_MPEG_2};

use crate::channel::ChannelDescriptor;
use crate::psi::pmt::{DESC_AC3, DESC_ISO639_LANGUAGE, DESC_SUBTITLING, DESC_TELETEXT};
use crate::ts::{MAX_PID, TS_PAYLOAD_START, TS_SIZE, TS_SYNC_BYTE};

const CRC_MPEG: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Synthetic transport-stream id stamped into generated PATs.
const PSEUDO_TSID: u16 = 0x8008;
/// First candidate for the synthetic PMT PID.
const PSEUDO_PMT_PID: u16 = 0x0084;

const MAX_SECTION_SIZE: usize = 4096;

/// Generates the PAT and PMT packets describing one channel.
///
/// The tables are rebuilt on every [`set_channel`](Self::set_channel);
/// each rebuild bumps the 5-bit version numbers modulo 32. Every call to
/// [`next_pat`](Self::next_pat) / [`next_pmt`](Self::next_pmt) bumps the
/// 4-bit continuity counter of the returned packet in place.
pub struct PatPmtGenerator {
    pat:            [u8; TS_SIZE],
    pmt:            Vec<[u8; TS_SIZE]>,
    pat_counter:    u8,
    pmt_counter:    u8,
    pat_version:    u8,
    pmt_version:    u8,
    pmt_pid:        u16,
    /// Back-pointer to the ES-info-length field of the stream entry
    /// currently being assembled.
    es_info_length: Option<usize>,
}

impl PatPmtGenerator {
    pub fn new(channel: &ChannelDescriptor) -> Self {
        let mut gen = Self {
            pat: [0xFF; TS_SIZE],
            pmt: Vec::new(),
            pat_counter: 0,
            pmt_counter: 0,
            pat_version: 0,
            pmt_version: 0,
            pmt_pid: 0,
            es_info_length: None,
        };
        gen.set_channel(channel);
        gen
    }

    /// Seeds the table versions, e.g. to continue a previous recording.
    pub fn set_versions(&mut self, pat_version: u8, pmt_version: u8) {
        self.pat_version = pat_version & 0x1F;
        self.pmt_version = pmt_version & 0x1F;
    }

    /// Regenerates PMT PID, PAT and PMT for `channel`.
    pub fn set_channel(&mut self, channel: &ChannelDescriptor) {
        self.generate_pmt_pid(channel);
        self.generate_pat();
        self.generate_pmt(channel);
    }

    pub fn pmt_pid(&self) -> u16 {
        self.pmt_pid
    }

    pub fn versions(&self) -> (u8, u8) {
        (self.pat_version, self.pmt_version)
    }

    /// The PAT packet, continuity counter bumped.
    pub fn next_pat(&mut self) -> &[u8; TS_SIZE] {
        Self::inc_counter(&mut self.pat_counter, &mut self.pat);
        &self.pat
    }

    /// The `index`-th PMT packet, continuity counter bumped, or `None`
    /// past the last one.
    pub fn next_pmt(&mut self, index: usize) -> Option<&[u8; TS_SIZE]> {
        let packet = self.pmt.get_mut(index)?;
        Self::inc_counter(&mut self.pmt_counter, packet);
        Some(packet)
    }

    fn inc_counter(counter: &mut u8, packet: &mut [u8; TS_SIZE]) {
        packet[3] = (packet[3] & 0xF0) | *counter;
        *counter = (*counter + 1) & 0x0F;
    }

    fn inc_version(version: &mut u8) {
        *version = (*version + 1) & 0x1F;
    }

    /// Picks a PMT PID that collides with none of the channel's PIDs,
    /// scanning upward from the default.
    fn generate_pmt_pid(&mut self, channel: &ChannelDescriptor) {
        let mut used = [false; MAX_PID];
        let mut set = |pid: u16| {
            if (pid as usize) < MAX_PID {
                used[pid as usize] = true;
            }
        };
        set(channel.vpid);
        set(channel.ppid);
        set(channel.tpid);
        for a in &channel.apids {
            set(a.pid);
        }
        for d in &channel.dpids {
            set(d.pid);
        }
        for s in &channel.spids {
            set(s.pid);
        }
        self.pmt_pid = PSEUDO_PMT_PID;
        while used[self.pmt_pid as usize] {
            self.pmt_pid += 1;
        }
    }

    fn generate_pat(&mut self) {
        self.pat = [0xFF; TS_SIZE];
        let p = &mut self.pat;
        let mut i = 0;
        p[i] = TS_SYNC_BYTE;
        i += 1;
        p[i] = TS_PAYLOAD_START; // flags (3), pid hi (5)
        i += 1;
        p[i] = 0x00; // pid lo
        i += 1;
        p[i] = 0x10; // flags (4), continuity counter (4)
        i += 1;
        p[i] = 0x00; // pointer field (payload unit start indicator is set)
        i += 1;
        let payload_start = i;
        p[i] = 0x00; // table id
        i += 1;
        p[i] = 0xB0; // section syntax indicator (1), dummy (3), section length hi (4)
        i += 1;
        let section_length = i;
        p[i] = 0x00; // section length lo (filled in later)
        i += 1;
        p[i] = (PSEUDO_TSID >> 8) as u8;
        i += 1;
        p[i] = PSEUDO_TSID as u8;
        i += 1;
        p[i] = 0xC1 | (self.pat_version << 1); // dummy (2), version number (5), current/next (1)
        i += 1;
        p[i] = 0x00; // section number
        i += 1;
        p[i] = 0x00; // last section number
        i += 1;
        p[i] = (self.pmt_pid >> 8) as u8; // program number hi
        i += 1;
        p[i] = self.pmt_pid as u8; // program number lo
        i += 1;
        p[i] = 0xE0 | (self.pmt_pid >> 8) as u8; // dummy (3), PMT pid hi (5)
        i += 1;
        p[i] = self.pmt_pid as u8; // PMT pid lo
        i += 1;
        p[section_length] = (i - section_length - 1 + 4) as u8; // +4 = length of CRC
        let crc = CRC_MPEG.checksum(&p[payload_start..i]);
        p[i..i + 4].copy_from_slice(&crc.to_be_bytes());
        Self::inc_version(&mut self.pat_version);
    }

    fn generate_pmt(&mut self, channel: &ChannelDescriptor) {
        // generate the complete PMT section:
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_SECTION_SIZE);
        self.pmt.clear();
        self.es_info_length = None;

        buf.push(0x02); // table id
        let section_length = buf.len();
        buf.push(0xB0); // section syntax indicator (1), dummy (3), section length hi (4)
        buf.push(0x00); // section length lo (filled in later)
        buf.push((self.pmt_pid >> 8) as u8); // program number hi
        buf.push(self.pmt_pid as u8); // program number lo
        buf.push(0xC1 | (self.pmt_version << 1)); // dummy (2), version number (5), current/next (1)
        buf.push(0x00); // section number
        buf.push(0x00); // last section number
        buf.push(0xE0 | (channel.vpid >> 8) as u8); // dummy (3), PCR pid hi (5)
        buf.push(channel.vpid as u8); // PCR pid lo
        buf.push(0xF0); // dummy (4), program info length hi (4)
        buf.push(0x00); // program info length lo

        if channel.vpid != 0 {
            self.make_stream(&mut buf, channel.vtype, channel.vpid);
        }
        for a in &channel.apids {
            self.make_stream(&mut buf, 0x04, a.pid);
            self.make_language_descriptor(&mut buf, &a.lang);
        }
        for d in &channel.dpids {
            self.make_stream(&mut buf, 0x06, d.pid);
            self.make_ac3_descriptor(&mut buf);
            self.make_language_descriptor(&mut buf, &d.lang);
        }
        for s in &channel.spids {
            self.make_stream(&mut buf, 0x06, s.pid);
            self.make_subtitling_descriptor(&mut buf, &s.lang);
        }
        if channel.tpid != 0 {
            self.make_stream(&mut buf, 0x06, channel.tpid);
            self.make_teletext_descriptor(&mut buf, channel);
        }

        let sl = buf.len() - section_length - 2 + 4; // +4 = length of CRC
        buf[section_length] |= ((sl >> 8) & 0x0F) as u8;
        buf[section_length + 1] = sl as u8;
        let crc = CRC_MPEG.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        // split the PMT section into several TS packets:
        let mut q = &buf[..];
        let mut pusi = true;
        while !q.is_empty() {
            let mut p = [0xFFu8; TS_SIZE];
            let mut j = 0;
            p[j] = TS_SYNC_BYTE;
            j += 1;
            let flags = if pusi { TS_PAYLOAD_START } else { 0x00 };
            p[j] = flags | (self.pmt_pid >> 8) as u8;
            j += 1;
            p[j] = self.pmt_pid as u8;
            j += 1;
            p[j] = 0x10; // flags (4), continuity counter (4)
            j += 1;
            if pusi {
                p[j] = 0x00; // pointer field (payload unit start indicator is set)
                j += 1;
                pusi = false;
            }
            let l = (TS_SIZE - j).min(q.len());
            p[j..j + l].copy_from_slice(&q[..l]);
            q = &q[l..];
            self.pmt.push(p);
        }
        Self::inc_version(&mut self.pmt_version);
    }

    fn make_stream(&mut self, buf: &mut Vec<u8>, stream_type: u8, pid: u16) {
        buf.push(stream_type);
        buf.push(0xE0 | (pid >> 8) as u8); // dummy (3), pid hi (5)
        buf.push(pid as u8);
        self.es_info_length = Some(buf.len());
        buf.push(0xF0); // dummy (4), ES info length hi
        buf.push(0x00); // ES info length lo
    }

    fn inc_es_info_length(&self, buf: &mut [u8], added: usize) {
        if let Some(idx) = self.es_info_length {
            let len =
                added + ((((buf[idx] & 0x0F) as usize) << 8) | buf[idx + 1] as usize);
            buf[idx] = 0xF0 | (len >> 8) as u8;
            buf[idx + 1] = len as u8;
        }
    }

    fn make_language_descriptor(&mut self, buf: &mut Vec<u8>, lang: &str) {
        let start = buf.len();
        buf.push(DESC_ISO639_LANGUAGE);
        buf.push(0x04); // length
        buf.extend_from_slice(&lang_bytes(lang));
        buf.push(0x01); // audio type
        let added = buf.len() - start;
        self.inc_es_info_length(buf, added);
    }

    fn make_ac3_descriptor(&mut self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.push(DESC_AC3);
        buf.push(0x01); // length
        buf.push(0x00);
        let added = buf.len() - start;
        self.inc_es_info_length(buf, added);
    }

    fn make_subtitling_descriptor(&mut self, buf: &mut Vec<u8>, lang: &str) {
        let start = buf.len();
        buf.push(DESC_SUBTITLING);
        buf.push(0x08); // length
        buf.extend_from_slice(&lang_bytes(lang));
        buf.push(0x00); // subtitling type
        buf.push(0x00); // composition page id hi
        buf.push(0x01); // composition page id lo
        buf.push(0x00); // ancillary page id hi
        buf.push(0x01); // ancillary page id lo
        let added = buf.len() - start;
        self.inc_es_info_length(buf, added);
    }

    fn make_teletext_descriptor(&mut self, buf: &mut Vec<u8>, channel: &ChannelDescriptor) {
        if channel.teletext_pages.is_empty() {
            return;
        }
        let start = buf.len();
        buf.push(DESC_TELETEXT);
        buf.push((channel.teletext_pages.len() * 5) as u8);
        for page in &channel.teletext_pages {
            buf.extend_from_slice(&lang_bytes(&page.lang));
            buf.push((page.teletext_type << 3) | (page.magazine & 0x07));
            buf.push(page.page);
        }
        let added = buf.len() - start;
        self.inc_es_info_length(buf, added);
    }
}

fn lang_bytes(lang: &str) -> [u8; 3] {
    let mut out = [b' '; 3];
    for (o, b) in out.iter_mut().zip(lang.bytes()) {
        *o = b;
    }
    out
}
