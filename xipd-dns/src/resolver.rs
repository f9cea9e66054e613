use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use trust_dns_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{
        DNSClass, Name, RData, Record,
        rdata::{A, CNAME},
    },
};

use crate::{
    engine::{Query, ResolutionEngine, ResolutionOutcome},
    server_handler::encode,
    upstream::{Transport, Upstream},
};

/// TTL of records synthesized from local rules.
pub const LOCAL_TTL: u32 = 60;

/// Records produced for one address lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
    pub response_code: ResponseCode,
    pub authoritative: bool,
    pub truncated: bool,
}

impl Answer {
    fn local(name: &Name, ip: Ipv4Addr) -> Self {
        Self {
            answers: vec![Record::from_rdata(name.clone(), LOCAL_TTL, RData::A(A(ip)))],
            authority: Vec::new(),
            additional: Vec::new(),
            response_code: ResponseCode::NoError,
            authoritative: true,
            truncated: false,
        }
    }

    fn from_upstream(mut reply: Message) -> Self {
        Self {
            truncated: reply.truncated(),
            answers: reply.take_answers(),
            authority: reply.take_name_servers(),
            additional: reply.take_additionals(),
            response_code: reply.response_code(),
            authoritative: false,
        }
    }
}

/// Local resolution engine in front of an upstream resolver chain.
///
/// Queries the engine cannot answer are handed to `upstream`; hostnames
/// produced by mapping rules are looked up there and returned behind a CNAME.
#[derive(Clone)]
pub struct DynamicResolver {
    engine: Arc<ResolutionEngine>,
    upstream: Arc<dyn Upstream>,
}

impl DynamicResolver {
    pub fn new(engine: ResolutionEngine, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            engine: Arc::new(engine),
            upstream,
        }
    }

    pub async fn lookup_address(&self, name: &Name, timeout: Option<Duration>) -> Result<Answer> {
        match self.engine.resolve(&Query::address(name.to_ascii())) {
            ResolutionOutcome::LiteralAddress(addr) => match parse_literal(name, &addr) {
                Some(ip) => Ok(Answer::local(name, ip)),
                None => self.upstream_answer(name, timeout).await,
            },
            ResolutionOutcome::IndirectName(target) => self.indirect_answer(name, &target, timeout).await,
            ResolutionOutcome::NoMatch => self.upstream_answer(name, timeout).await,
        }
    }

    /// Handles one wire-format request received over `transport` and returns
    /// the encoded reply, if any. Forwarded requests keep their transport.
    pub async fn handle_packet(&self, packet: &[u8], transport: Transport) -> Result<Option<Vec<u8>>> {
        let msg = match Message::from_vec(packet) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Failed to parse DNS message: {:?}", e);
                return Ok(None);
            }
        };

        if msg.message_type() != MessageType::Query || msg.queries().is_empty() {
            return Ok(None);
        }

        // we handle only first query
        let query = &msg.queries()[0];
        let qname = query.name();

        // only standard IN queries are answered locally
        let outcome = if msg.op_code() == OpCode::Query && query.query_class() == DNSClass::IN {
            self.engine
                .resolve(&Query::new(qname.to_ascii(), query.query_type()))
        } else {
            ResolutionOutcome::NoMatch
        };

        let answer = match outcome {
            ResolutionOutcome::LiteralAddress(addr) => {
                parse_literal(qname, &addr).map(|ip| Ok(Answer::local(qname, ip)))
            }
            ResolutionOutcome::IndirectName(target) => {
                Some(self.indirect_answer(qname, &target, None).await)
            }
            ResolutionOutcome::NoMatch => None,
        };

        let resp = match answer {
            Some(Ok(answer)) => {
                log::info!("Answered {} with {} records", qname, answer.answers.len());
                build_response(&msg, answer)
            }
            Some(Err(e)) => {
                log::warn!("Resolving {} failed: {:?}", qname, e);
                servfail(&msg)
            }
            None => match self.upstream.forward(packet, transport, None).await {
                Ok(reply) => return Ok(Some(reply)),
                Err(e) => {
                    log::warn!("Forwarding {} failed: {:?}", qname, e);
                    servfail(&msg)
                }
            },
        };

        let reply = encode(&resp)?;
        if transport == Transport::Udp && reply.len() > msg.max_payload() as usize {
            log::debug!("reply for {} exceeds {} bytes, truncating", qname, msg.max_payload());
            return Ok(Some(encode(&truncated(&msg))?));
        }

        Ok(Some(reply))
    }

    async fn indirect_answer(&self, name: &Name, target: &str, timeout: Option<Duration>) -> Result<Answer> {
        let target = Name::from_ascii(format!("{}.", target.trim_end_matches('.')))
            .with_context(|| format!("mapped hostname {:?} is not a valid name", target))?;

        let reply = self.upstream.lookup_address(&target, timeout).await?;

        let mut answer = Answer::from_upstream(reply);
        answer.answers.insert(
            0,
            Record::from_rdata(name.clone(), LOCAL_TTL, RData::CNAME(CNAME(target))),
        );

        Ok(answer)
    }

    async fn upstream_answer(&self, name: &Name, timeout: Option<Duration>) -> Result<Answer> {
        let reply = self.upstream.lookup_address(name, timeout).await?;

        Ok(Answer::from_upstream(reply))
    }
}

fn parse_literal(name: &Name, addr: &str) -> Option<Ipv4Addr> {
    match addr.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            log::warn!("{} maps to {:?}, which is not an IPv4 address; delegating", name, addr);
            None
        }
    }
}

fn response_for(request: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(request.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_recursion_desired(request.recursion_desired());
    resp.set_recursion_available(true);
    resp.add_queries(request.queries().iter().take(1).cloned());
    resp
}

fn build_response(request: &Message, answer: Answer) -> Message {
    let mut resp = response_for(request);
    resp.set_authoritative(answer.authoritative);
    resp.set_truncated(answer.truncated);
    resp.set_response_code(answer.response_code);
    resp.insert_answers(answer.answers);
    resp.insert_name_servers(answer.authority);
    resp.insert_additionals(answer.additional);
    resp
}

fn servfail(request: &Message) -> Message {
    let mut resp = response_for(request);
    resp.set_response_code(ResponseCode::ServFail);
    resp
}

fn truncated(request: &Message) -> Message {
    let mut resp = response_for(request);
    resp.set_truncated(true);
    resp
}
