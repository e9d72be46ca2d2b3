//! Builds outgoing DNS messages from textual input records.
//!
//! A query record is a single `NAME TYPE` line. An update record is a group of
//! lines: the first names the zone, the rest are `add`/`delete` directives in
//! RFC 2136 terms. The caller supplies the 16-bit message id; it doubles as
//! the sender's slot index, so it must round-trip through the server
//! unchanged.

use std::str::FromStr as _;
use std::sync::Arc;

use domain::base::iana::OptionCode;
use domain::base::name::Name;
use domain::base::opt::UnknownOptData;
use domain::base::{MessageBuilder, Question, Rtype};

mod tsig;
mod update;

pub use tsig::{TsigAlgorithm, TsigKey};

/// Advertised EDNS0 payload size, also the receive buffer size.
pub const MAX_EDNS_PACKET: usize = 4096;

/// Textual labels for the sixteen header RCODEs, indexed by value.
pub const RCODE_LABELS: [&str; 16] = [
    "NOERROR", "FORMERR", "SERVFAIL", "NXDOMAIN", "NOTIMP", "REFUSED", "YXDOMAIN", "YXRRSET",
    "NXRRSET", "NOTAUTH", "NOTZONE", "rcode11", "rcode12", "rcode13", "rcode14", "rcode15",
];

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("malformed input record: {0}")]
    Malformed(String),
    #[error("unsupported record data: {0}")]
    Unsupported(String),
    #[error("failed to assemble message: {0}")]
    Build(String),
}

/// One raw EDNS option, from the `code:hex-value` command line syntax.
#[derive(Debug, Clone)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

impl EdnsOption {
    pub fn parse(spec: &str) -> Result<Self, EncodeError> {
        let (code, value) = spec
            .split_once(':')
            .ok_or_else(|| EncodeError::Malformed(format!("expected code:value, got `{spec}`")))?;
        let code = code
            .parse::<u16>()
            .map_err(|_| EncodeError::Malformed(format!("bad EDNS option code `{code}`")))?;
        let data = hex::decode(value)
            .map_err(|_| EncodeError::Malformed(format!("bad EDNS option value `{value}`")))?;

        Ok(Self { code, data })
    }
}

/// Per-worker request builder.
///
/// Construction validates nothing beyond what command-line parsing already
/// did; all record-level failures surface from [`RequestEncoder::encode`] so a
/// bad input line skips one record instead of aborting the run.
#[derive(Debug, Clone, Default)]
pub struct RequestEncoder {
    updates: bool,
    edns: bool,
    dnssec: bool,
    tsig: Option<Arc<TsigKey>>,
    edns_option: Option<EdnsOption>,
}

impl RequestEncoder {
    pub fn new(updates: bool) -> Self {
        Self {
            updates,
            ..Self::default()
        }
    }

    pub fn with_edns(mut self, edns: bool) -> Self {
        self.edns = edns;
        self
    }

    pub fn with_dnssec(mut self, dnssec: bool) -> Self {
        self.dnssec = dnssec;
        self
    }

    pub fn with_tsig(mut self, key: Option<Arc<TsigKey>>) -> Self {
        self.tsig = key;
        self
    }

    pub fn with_edns_option(mut self, option: Option<EdnsOption>) -> Self {
        self.edns_option = option;
        self
    }

    /// Encodes one input record into a wire-format message with the given id.
    pub fn encode(&self, record: &str, qid: u16) -> Result<Vec<u8>, EncodeError> {
        let message = if self.updates {
            update::build(record, qid)?
        } else {
            self.build_query(record, qid)?
        };

        match &self.tsig {
            Some(key) => tsig::sign(message, key),
            None => Ok(message),
        }
    }

    fn build_query(&self, record: &str, qid: u16) -> Result<Vec<u8>, EncodeError> {
        let mut words = record.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| EncodeError::Malformed("empty query record".to_string()))?;
        let qtype = words
            .next()
            .ok_or_else(|| EncodeError::Malformed(format!("missing query type in `{record}`")))?;

        let name = parse_name(name)?;
        let qtype = Rtype::from_str(qtype)
            .map_err(|_| EncodeError::Malformed(format!("bad query type `{qtype}`")))?;

        let mut builder = MessageBuilder::new_vec();
        builder.header_mut().set_id(qid);
        builder.header_mut().set_rd(true);

        let mut question = builder.question();
        question
            .push(Question::new_in(name, qtype))
            .map_err(|e| EncodeError::Build(e.to_string()))?;

        let mut additional = question.additional();
        if self.edns {
            let dnssec = self.dnssec;
            let option_data = match &self.edns_option {
                Some(option) => Some(
                    UnknownOptData::new(
                        OptionCode::from(option.code),
                        option.data.clone(),
                    )
                    .map_err(|e| EncodeError::Build(e.to_string()))?,
                ),
                None => None,
            };
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(MAX_EDNS_PACKET as u16);
                    if dnssec {
                        opt.set_dnssec_ok(true);
                    }
                    if let Some(data) = &option_data {
                        opt.push(data)?;
                    }
                    Ok(())
                })
                .map_err(|e| EncodeError::Build(e.to_string()))?;
        }

        Ok(additional.into_message().into_octets())
    }
}

fn parse_name(text: &str) -> Result<Name<Vec<u8>>, EncodeError> {
    Name::vec_from_str(&text.to_ascii_lowercase())
        .map_err(|_| EncodeError::Malformed(format!("bad domain name `{text}`")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use domain::base::iana::Opcode;
    use domain::base::{Message, ToName as _};

    fn name(text: &str) -> Name<Vec<u8>> {
        parse_name(text).unwrap()
    }

    #[test]
    fn builds_plain_query() {
        let wire = RequestEncoder::new(false)
            .encode("example.com A", 4711)
            .unwrap();

        let msg = Message::from_octets(wire).unwrap();
        assert_eq!(msg.header().id(), 4711);
        assert!(msg.header().rd());
        assert!(!msg.header().qr());

        let question = msg.first_question().unwrap();
        assert_eq!(question.qtype(), Rtype::A);
        assert_eq!(question.qname().to_name::<Vec<u8>>(), name("example.com"));
        assert!(msg.opt().is_none());
    }

    #[test]
    fn query_type_is_case_insensitive_on_names_only() {
        let wire = RequestEncoder::new(false)
            .encode("EXAMPLE.com AAAA", 1)
            .unwrap();

        let msg = Message::from_octets(wire).unwrap();
        let question = msg.first_question().unwrap();
        assert_eq!(question.qname().to_name::<Vec<u8>>(), name("example.com"));
        assert_eq!(question.qtype(), Rtype::AAAA);
    }

    #[test]
    fn rejects_record_without_type() {
        let err = RequestEncoder::new(false).encode("example.com", 1);

        assert!(matches!(err, Err(EncodeError::Malformed(_))));
    }

    #[test]
    fn edns_adds_opt_record_with_payload_size() {
        let wire = RequestEncoder::new(false)
            .with_edns(true)
            .encode("example.com A", 7)
            .unwrap();

        let msg = Message::from_octets(wire).unwrap();
        let opt = msg.opt().unwrap();
        assert_eq!(opt.udp_payload_size(), MAX_EDNS_PACKET as u16);
        assert!(!opt.dnssec_ok());
    }

    #[test]
    fn dnssec_sets_do_bit() {
        let wire = RequestEncoder::new(false)
            .with_edns(true)
            .with_dnssec(true)
            .encode("example.com DNSKEY", 7)
            .unwrap();

        let msg = Message::from_octets(wire).unwrap();
        assert!(msg.opt().unwrap().dnssec_ok());
    }

    #[test]
    fn edns_option_round_trips() {
        let option = EdnsOption::parse("65001:deadbeef").unwrap();
        assert_eq!(option.code, 65001);
        assert_eq!(option.data, vec![0xde, 0xad, 0xbe, 0xef]);

        let wire = RequestEncoder::new(false)
            .with_edns(true)
            .with_edns_option(Some(option))
            .encode("example.com A", 7)
            .unwrap();

        // The OPT record must still parse as a message.
        let msg = Message::from_octets(wire).unwrap();
        assert!(msg.opt().is_some());
    }

    #[test]
    fn rejects_bad_edns_option() {
        assert!(EdnsOption::parse("no-colon").is_err());
        assert!(EdnsOption::parse("65001:xyz").is_err());
        assert!(EdnsOption::parse("99999999:aa").is_err());
    }

    #[test]
    fn update_message_carries_zone_and_records() {
        let record = "example.com\nadd www.example.com 300 A 192.0.2.1\ndelete old.example.com";
        let wire = RequestEncoder::new(true).encode(record, 99).unwrap();

        let msg = Message::from_octets(wire).unwrap();
        assert_eq!(msg.header().id(), 99);
        assert_eq!(msg.header().opcode(), Opcode::UPDATE);

        let zone = msg.first_question().unwrap();
        assert_eq!(zone.qtype(), Rtype::SOA);
        assert_eq!(zone.qname().to_name::<Vec<u8>>(), name("example.com"));

        assert_eq!(msg.header_counts().nscount(), 2);
    }

    #[test]
    fn tsig_signed_query_parses_and_grows_additional_section() {
        let key = TsigKey::parse("hmac-sha256:testkey:c2VjcmV0c2VjcmV0").unwrap();
        let wire = RequestEncoder::new(false)
            .with_tsig(Some(Arc::new(key)))
            .encode("example.com A", 31000)
            .unwrap();

        let msg = Message::from_octets(wire).unwrap();
        assert_eq!(msg.header().id(), 31000);
        assert_eq!(msg.header_counts().arcount(), 1);

        let record = msg.additional().unwrap().next().unwrap().unwrap();
        assert_eq!(record.rtype(), Rtype::TSIG);
    }
}
