// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Structured event logging in the [qlog] NDJSON-sequence format.
//!
//! This crate doesn't know anything about QUIC itself; `quiche` builds
//! [`events::quic`] values from its own internal state and hands them to a
//! [`QlogStreamer`] behind the `qlog` Cargo feature. The wire shape tracks
//! the parts of the qlog QUIC/HTTP3 event schema this workspace actually
//! emits, not the full schema.
//!
//! [qlog]: https://www.ietf.org/archive/id/draft-ietf-quic-qlog-main-schema-08.html

pub mod events;

use std::io::Write;

use serde::Serialize;

/// Top-of-file metadata written once, before any event.
#[derive(Serialize)]
struct LogFileSeq {
    file_schema: &'static str,
    serialization_format: &'static str,
    trace: TraceSeq,
}

#[derive(Serialize)]
struct TraceSeq {
    vantage_point: VantagePoint,
    title: Option<String>,
}

/// Which side of the connection produced this trace.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VantagePointType {
    Client,
    Server,
}

#[derive(Serialize)]
pub struct VantagePoint {
    #[serde(rename = "type")]
    pub ty: VantagePointType,
}

/// A single qlog JSON-SEQ record: `<RS> json-value <LF>`.
#[derive(Serialize)]
struct Record<'a> {
    time: f64,
    name: &'a str,
    data: &'a events::EventData,
}

/// Writes qlog events as newline-delimited, RS-separated JSON to any
/// [`Write`] sink (typically a [`std::fs::File`]).
///
/// One `QlogStreamer` is owned per connection, mirroring the per-connection
/// buffer-pool ownership rule in spec.md §5.
pub struct QlogStreamer<W: Write> {
    writer: W,
    start: std::time::Instant,
    header_written: bool,
    vantage_point: VantagePointType,
    title: Option<String>,
}

impl<W: Write> QlogStreamer<W> {
    pub fn new(writer: W, vantage_point: VantagePointType, title: Option<String>) -> Self {
        QlogStreamer {
            writer,
            start: std::time::Instant::now(),
            header_written: false,
            vantage_point,
            title,
        }
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        if self.header_written {
            return Ok(());
        }

        let header = LogFileSeq {
            file_schema: "urn:ietf:params:qlog:file:sequential",
            serialization_format: "application/qlog+json-seq",
            trace: TraceSeq {
                vantage_point: VantagePoint {
                    ty: self.vantage_point,
                },
                title: self.title.clone(),
            },
        };

        self.writer.write_all(&[0x1e])?;
        serde_json::to_writer(&mut self.writer, &header)?;
        self.writer.write_all(b"\n")?;
        self.header_written = true;
        Ok(())
    }

    /// Appends one event, tagged with the elapsed time since this streamer
    /// was created.
    pub fn add_event(&mut self, name: &str, data: events::EventData) -> std::io::Result<()> {
        self.write_header()?;

        let record = Record {
            time: self.start.elapsed().as_secs_f64() * 1000.0,
            name,
            data: &data,
        };

        self.writer.write_all(&[0x1e])?;
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::quic::*;
    use crate::events::EventData;

    #[test]
    fn emits_header_then_event() {
        let mut buf = Vec::new();
        {
            let mut streamer =
                QlogStreamer::new(&mut buf, VantagePointType::Server, Some("t".into()));
            streamer
                .add_event(
                    "quic:packet_sent",
                    EventData::PacketSent(PacketSent {
                        header: PacketHeader {
                            packet_type: PacketType::OneRtt,
                            packet_number: Some(1),
                            ..Default::default()
                        },
                        frames: None,
                    }),
                )
                .unwrap();
        }

        let text = String::from_utf8(buf).unwrap();
        // Two JSON-SEQ records, each RS-prefixed and LF-terminated.
        assert_eq!(text.matches('\u{1e}').count(), 2);
        assert!(text.contains("quic:packet_sent"));
        assert!(text.contains("\"packet_type\":\"one_rtt\""));
    }
}
