//! Submodule bundling all code for exit policy parsing in descriptors

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::consensus::CondensedExitPolicy;
use crate::dispatch::Handled;
use crate::error::{DocumentParseError, ErrorContext};
use crate::meta::{Item, Lines};

use super::RouterDescriptorBuilder;

use ipnet::IpNet;

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ExitPolicyAddress {
    Wildcard,
    Address(IpNet),
}

impl ExitPolicyAddress {
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            ExitPolicyAddress::Wildcard => true,
            ExitPolicyAddress::Address(net) => net.contains(ip),
        }
    }
}

impl fmt::Display for ExitPolicyAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPolicyAddress::Wildcard => write!(f, "*"),
            ExitPolicyAddress::Address(addr) => write!(f, "{}", addr),
        }
    }
}

impl FromStr for ExitPolicyAddress {
    type Err = DocumentParseError;

    fn from_str(addr_str: &str) -> Result<Self, Self::Err> {
        if addr_str == "*" {
            return Ok(ExitPolicyAddress::Wildcard);
        }
        let addr_str = addr_str.trim_start_matches('[').replace("]", "");
        let network = if addr_str.contains('/') {
            IpNet::from_str(&addr_str).map_err(|_| {
                DocumentParseError::invalid(format!("exit policy network '{}'", addr_str))
            })?
        } else {
            let addr = addr_str.parse::<IpAddr>().context("exit policy address")?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            IpNet::new(addr, prefix).map_err(|_| DocumentParseError::invalid("exit policy address"))?
        };
        Ok(ExitPolicyAddress::Address(network))
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum ExitPortRange<T> {
    Single(T),
    Interval(T, T),
}

impl fmt::Display for ExitPortRange<u16> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPortRange::Single(num) => write!(f, "{}", num),
            ExitPortRange::Interval(num1, num2) => write!(f, "{}-{}", num1, num2),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ExitPolicyType {
    Accept,
    Reject,
}

impl fmt::Display for ExitPolicyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPolicyType::Accept => write!(f, "accept"),
            ExitPolicyType::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ExitPolicyPort {
    Wildcard,
    Port(ExitPortRange<u16>),
}

impl ExitPolicyPort {
    pub fn contains(&self, port: u16) -> bool {
        match self {
            ExitPolicyPort::Wildcard => true,
            ExitPolicyPort::Port(ExitPortRange::Single(v)) => *v == port,
            ExitPolicyPort::Port(ExitPortRange::Interval(from, to)) => *from <= port && port <= *to,
        }
    }
}

impl fmt::Display for ExitPolicyPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitPolicyPort::Wildcard => write!(f, "*"),
            ExitPolicyPort::Port(port) => write!(f, "{}", port),
        }
    }
}

/// One `accept`/`reject` line: a verdict and its rule.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DescriptorExitPolicyRule {
    pub ep_type: ExitPolicyType,
    pub address: ExitPolicyAddress,
    pub port: ExitPolicyPort,
}

impl DescriptorExitPolicyRule {
    pub fn matches(&self, ip: &IpAddr, port: u16) -> bool {
        self.address.contains(ip) && self.port.contains(port)
    }
}

impl fmt::Display for DescriptorExitPolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}:{}", self.ep_type, self.address, self.port)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct DescriptorExitPolicy {
    pub rules: Vec<DescriptorExitPolicyRule>,
}

impl DescriptorExitPolicy {
    pub(super) fn new() -> Self {
        DescriptorExitPolicy { rules: Vec::new() }
    }

    pub(super) fn add_rule(&mut self, epr: DescriptorExitPolicyRule) {
        self.rules.push(epr);
    }

    /// Apply the first matching rule. Addresses no rule matches are accepted.
    pub fn allows(&self, ip: IpAddr, port: u16) -> bool {
        self.rules
            .iter()
            .find(|r| r.matches(&ip, port))
            .map_or(true, |r| r.ep_type == ExitPolicyType::Accept)
    }
}

fn parse_exit_policy_port(port_str: &str) -> Result<ExitPolicyPort, DocumentParseError> {
    match port_str {
        "*" => Ok(ExitPolicyPort::Wildcard),
        _ => Ok(ExitPolicyPort::Port(parse_range(port_str)?)),
    }
}

fn parse_range(input: &str) -> Result<ExitPortRange<u16>, DocumentParseError> {
    match input.split_once('-') {
        Some((min, max)) => {
            let min = min.parse::<u16>().context("exit policy port (from)")?;
            let max = max.parse::<u16>().context("exit policy port (to)")?;
            if min > max {
                return Err(DocumentParseError::invalid(format!("exit policy range '{}'", input)));
            }
            Ok(ExitPortRange::Interval(min, max))
        }
        None => Ok(ExitPortRange::Single(
            input.parse::<u16>().context("exit policy port")?,
        )),
    }
}

fn parse_exit_policy_rule(
    descriptor: &mut RouterDescriptorBuilder,
    item: &Item<'_>,
    ept: ExitPolicyType,
) -> Result<Handled, DocumentParseError> {
    // the address may itself contain colons ("[::1]:80")
    match item.args[0].rsplit_once(':') {
        Some((address, port)) => {
            descriptor.add_exit_policy_rule(DescriptorExitPolicyRule {
                ep_type: ept,
                address: address.parse()?,
                port: parse_exit_policy_port(port)?,
            });
            Ok(Handled::Stored)
        }
        None => Err(item.malformed("expected address:port")),
    }
}

pub(super) fn kw_accept(
    descriptor: &mut RouterDescriptorBuilder,
    item: &Item<'_>,
    _: &mut Lines<'_>,
) -> Result<Handled, DocumentParseError> {
    parse_exit_policy_rule(descriptor, item, ExitPolicyType::Accept)
}

pub(super) fn kw_reject(
    descriptor: &mut RouterDescriptorBuilder,
    item: &Item<'_>,
    _: &mut Lines<'_>,
) -> Result<Handled, DocumentParseError> {
    parse_exit_policy_rule(descriptor, item, ExitPolicyType::Reject)
}

pub(super) fn kw_ipv6_policy(
    builder: &mut RouterDescriptorBuilder,
    item: &Item<'_>,
    _: &mut Lines<'_>,
) -> Result<Handled, DocumentParseError> {
    builder.ipv6_policy(item.joined_args().parse::<CondensedExitPolicy>()?);
    Ok(Handled::Stored)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn addresses() {
        let net: ExitPolicyAddress = "18.0.0.0/8".parse().unwrap();
        assert!(net.contains(&"18.7.22.69".parse().unwrap()));
        assert!(!net.contains(&"19.0.0.1".parse().unwrap()));

        let host: ExitPolicyAddress = "192.0.2.1".parse().unwrap();
        assert_eq!(host.to_string(), "192.0.2.1/32");

        let v6: ExitPolicyAddress = "[2001:db8::]/32".parse().unwrap();
        assert!(v6.contains(&"2001:db8::1".parse().unwrap()));

        assert!("300.0.0.1".parse::<ExitPolicyAddress>().is_err());
    }

    #[test]
    fn ports() {
        assert!(parse_exit_policy_port("*").unwrap().contains(1));
        let range = parse_exit_policy_port("6660-6669").unwrap();
        assert!(range.contains(6665));
        assert!(!range.contains(6670));
        assert_eq!(range.to_string(), "6660-6669");
        assert!(parse_exit_policy_port("90-80").is_err());
        assert!(parse_exit_policy_port("http").is_err());
    }

    #[test]
    fn first_match_wins() {
        let policy = DescriptorExitPolicy {
            rules: vec![
                DescriptorExitPolicyRule {
                    ep_type: ExitPolicyType::Accept,
                    address: ExitPolicyAddress::Wildcard,
                    port: ExitPolicyPort::Port(ExitPortRange::Single(443)),
                },
                DescriptorExitPolicyRule {
                    ep_type: ExitPolicyType::Reject,
                    address: ExitPolicyAddress::Wildcard,
                    port: ExitPolicyPort::Wildcard,
                },
            ],
        };
        let ip = "198.51.100.4".parse().unwrap();
        assert!(policy.allows(ip, 443));
        assert!(!policy.allows(ip, 80));
        assert!(DescriptorExitPolicy::new().allows(ip, 80));
    }
}
