//! Dynamic update messages (RFC 2136).
//!
//! The first line of an update record names the zone; the remaining lines are
//! directives:
//!
//! ```text
//! add <name> <ttl> <type> <rdata>
//! delete <name> [<type> [<rdata>]]
//! ```
//!
//! Record data is understood for A, AAAA, CNAME, NS, PTR and MX; any other
//! type can be given in the RFC 3597 generic form (`\# <length> <hex>`).

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr as _;

use domain::base::iana::{Class, Opcode};
use domain::base::message_builder::AuthorityBuilder;
use domain::base::name::Name;
use domain::base::rdata::{ComposeRecordData, UnknownRecordData};
use domain::base::{MessageBuilder, Question, Record, Rtype, Ttl};
use domain::rdata::{A, Aaaa, Cname, Mx, Ns, Ptr};

use crate::{EncodeError, parse_name};

pub(crate) fn build(record: &str, qid: u16) -> Result<Vec<u8>, EncodeError> {
    let mut lines = record.lines();
    let zone = lines
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| EncodeError::Malformed("update record without a zone line".to_string()))?;
    let zone = parse_name(zone)?;

    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(qid);
    builder.header_mut().set_opcode(Opcode::UPDATE);

    let mut question = builder.question();
    question
        .push(Question::new(zone, Rtype::SOA, Class::IN))
        .map_err(|e| EncodeError::Build(e.to_string()))?;

    let mut update = question.authority();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        push_directive(&mut update, line)?;
    }

    Ok(update.additional().into_message().into_octets())
}

fn push_directive(update: &mut AuthorityBuilder<Vec<u8>>, line: &str) -> Result<(), EncodeError> {
    let mut words = line.split_whitespace();
    let verb = words
        .next()
        .ok_or_else(|| EncodeError::Malformed("empty update directive".to_string()))?;

    match verb.to_ascii_lowercase().as_str() {
        "add" => {
            let name = parse_name(next_word(&mut words, line)?)?;
            let ttl = next_word(&mut words, line)?
                .parse::<u32>()
                .map_err(|_| EncodeError::Malformed(format!("bad TTL in `{line}`")))?;
            let rtype = parse_rtype(next_word(&mut words, line)?)?;
            let rdata = words.collect::<Vec<_>>().join(" ");
            push_with_rdata(update, name, Class::IN, Ttl::from_secs(ttl), rtype, &rdata)
        }
        "delete" => {
            let name = parse_name(next_word(&mut words, line)?)?;
            let Some(rtype) = words.next() else {
                // Delete every RRset at the name.
                return push_empty(update, name, Class::ANY, Rtype::ANY);
            };
            let rtype = parse_rtype(rtype)?;
            let rdata = words.collect::<Vec<_>>().join(" ");
            if rdata.is_empty() {
                // Delete one whole RRset.
                push_empty(update, name, Class::ANY, rtype)
            } else {
                // Delete one specific record.
                push_with_rdata(update, name, Class::NONE, Ttl::from_secs(0), rtype, &rdata)
            }
        }
        other => Err(EncodeError::Unsupported(format!(
            "update directive `{other}`"
        ))),
    }
}

fn next_word<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    line: &str,
) -> Result<&'a str, EncodeError> {
    words
        .next()
        .ok_or_else(|| EncodeError::Malformed(format!("truncated update directive `{line}`")))
}

fn parse_rtype(text: &str) -> Result<Rtype, EncodeError> {
    Rtype::from_str(text).map_err(|_| EncodeError::Malformed(format!("bad record type `{text}`")))
}

fn push_with_rdata(
    update: &mut AuthorityBuilder<Vec<u8>>,
    name: Name<Vec<u8>>,
    class: Class,
    ttl: Ttl,
    rtype: Rtype,
    rdata: &str,
) -> Result<(), EncodeError> {
    if let Some(generic) = rdata.strip_prefix(r"\#") {
        return push_generic(update, name, class, ttl, rtype, generic);
    }

    match rtype {
        Rtype::A => {
            let addr = rdata
                .parse::<Ipv4Addr>()
                .map_err(|_| EncodeError::Malformed(format!("bad A address `{rdata}`")))?;
            push(update, Record::new(name, class, ttl, A::new(addr)))
        }
        Rtype::AAAA => {
            let addr = rdata
                .parse::<Ipv6Addr>()
                .map_err(|_| EncodeError::Malformed(format!("bad AAAA address `{rdata}`")))?;
            push(update, Record::new(name, class, ttl, Aaaa::new(addr)))
        }
        Rtype::CNAME => push(update, Record::new(name, class, ttl, Cname::new(parse_name(rdata)?))),
        Rtype::NS => push(update, Record::new(name, class, ttl, Ns::new(parse_name(rdata)?))),
        Rtype::PTR => push(update, Record::new(name, class, ttl, Ptr::new(parse_name(rdata)?))),
        Rtype::MX => {
            let (preference, exchange) = rdata.split_once(' ').ok_or_else(|| {
                EncodeError::Malformed(format!("MX data needs preference and exchange: `{rdata}`"))
            })?;
            let preference = preference
                .parse::<u16>()
                .map_err(|_| EncodeError::Malformed(format!("bad MX preference `{preference}`")))?;
            let exchange = parse_name(exchange.trim())?;
            push(update, Record::new(name, class, ttl, Mx::new(preference, exchange)))
        }
        other => Err(EncodeError::Unsupported(format!(
            "record data for type {other} (use the \\# generic form)"
        ))),
    }
}

/// RFC 3597 generic record data: `\# <length> <hex bytes>`.
fn push_generic(
    update: &mut AuthorityBuilder<Vec<u8>>,
    name: Name<Vec<u8>>,
    class: Class,
    ttl: Ttl,
    rtype: Rtype,
    generic: &str,
) -> Result<(), EncodeError> {
    let mut words = generic.split_whitespace();
    let length = next_word(&mut words, generic)?
        .parse::<usize>()
        .map_err(|_| EncodeError::Malformed(format!("bad generic rdata length in `{generic}`")))?;
    let data = hex::decode(words.collect::<String>())
        .map_err(|_| EncodeError::Malformed(format!("bad generic rdata hex in `{generic}`")))?;
    if data.len() != length {
        return Err(EncodeError::Malformed(format!(
            "generic rdata length {length} does not match {} data bytes",
            data.len()
        )));
    }

    let data = UnknownRecordData::from_octets(rtype, data)
        .map_err(|e| EncodeError::Build(e.to_string()))?;
    push(update, Record::new(name, class, ttl, data))
}

fn push_empty(
    update: &mut AuthorityBuilder<Vec<u8>>,
    name: Name<Vec<u8>>,
    class: Class,
    rtype: Rtype,
) -> Result<(), EncodeError> {
    let data = UnknownRecordData::from_octets(rtype, Vec::new())
        .map_err(|e| EncodeError::Build(e.to_string()))?;
    push(update, Record::new(name, class, Ttl::from_secs(0), data))
}

fn push<D: ComposeRecordData>(
    update: &mut AuthorityBuilder<Vec<u8>>,
    record: Record<Name<Vec<u8>>, D>,
) -> Result<(), EncodeError> {
    update
        .push(record)
        .map_err(|e| EncodeError::Build(e.to_string()))
}
