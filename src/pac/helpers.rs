//! PAC helper functions exposed to the script sandbox
//!
//! The Netscape helper set plus the Microsoft IPv6-aware extensions,
//! registered as native functions on each pooled engine. DNS lookups are
//! blocking; that is fine because every engine lives on its own dedicated
//! worker thread.

use std::cell::RefCell;
use std::net::{IpAddr, ToSocketAddrs, UdpSocket};
use std::str::FromStr;

use boa_engine::{js_string, Context, JsArgs, JsNativeError, JsResult, JsString, JsValue, NativeFunction};
use ipnet::{IpNet, Ipv4Net};
use tracing::{debug, warn};

use super::datetime;
use super::glob::GlobPatternCache;

thread_local! {
    // One compiled-pattern cache per engine worker thread.
    static GLOB_CACHE: RefCell<GlobPatternCache> = RefCell::new(GlobPatternCache::default());
}

/// Register the full helper contract on a context.
pub fn register_helpers(context: &mut Context) -> JsResult<()> {
    let bindings: [(&str, usize, fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>); 19] = [
        ("isPlainHostName", 1, is_plain_host_name),
        ("dnsDomainIs", 2, dns_domain_is),
        ("localHostOrDomainIs", 2, local_host_or_domain_is),
        ("isResolvable", 1, is_resolvable),
        ("dnsResolve", 1, dns_resolve),
        ("myIpAddress", 0, my_ip_address),
        ("isInNet", 3, is_in_net),
        ("dnsDomainLevels", 1, dns_domain_levels),
        ("shExpMatch", 2, sh_exp_match),
        ("weekdayRange", 2, weekday_range),
        ("dateRange", 2, date_range),
        ("timeRange", 2, time_range),
        ("isResolvableEx", 1, is_resolvable_ex),
        ("dnsResolveEx", 1, dns_resolve_ex),
        ("myIpAddressEx", 0, my_ip_address_ex),
        ("isInNetEx", 2, is_in_net_ex),
        ("sortIpAddressList", 1, sort_ip_address_list),
        ("getClientVersion", 0, get_client_version),
        ("alert", 1, alert),
    ];

    for (name, length, body) in bindings {
        context.register_global_callable(
            JsString::from(name),
            length,
            NativeFunction::from_fn_ptr(body),
        )?;
    }
    Ok(())
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn string_args(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    args.iter()
        .map(|arg| Ok(arg.to_string(context)?.to_std_string_escaped()))
        .collect()
}

fn resolve_all(host: &str) -> Vec<IpAddr> {
    (host, 0)
        .to_socket_addrs()
        .map(|addrs| addrs.map(|addr| addr.ip()).collect())
        .unwrap_or_default()
}

fn resolve_ipv4(host: &str) -> Option<IpAddr> {
    resolve_all(host).into_iter().find(|ip| ip.is_ipv4())
}

/// Primary outbound address, discovered without sending any packets: a
/// connected UDP socket reveals the source address the kernel would pick.
fn primary_local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn primary_local_ipv6() -> Option<IpAddr> {
    let socket = UdpSocket::bind("[::]:0").ok()?;
    socket.connect("[2001:4860:4860::8888]:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_ipv6() {
        Some(ip)
    } else {
        None
    }
}

// *************************************************************
//  Netscape helper set
// *************************************************************

fn is_plain_host_name(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(!host.contains('.')))
}

fn dns_domain_is(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let domain = string_arg(args, 1, ctx)?;
    let matched = match host.find('.') {
        Some(dot) if dot < host.len() - 1 => host[dot..] == domain || host[dot + 1..] == domain,
        _ => false,
    };
    Ok(JsValue::from(matched))
}

fn local_host_or_domain_is(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let hostdom = string_arg(args, 1, ctx)?;
    let matched = host == hostdom
        || hostdom
            .split('.')
            .find(|part| !part.is_empty())
            .map(|first| first == host)
            .unwrap_or(false);
    Ok(JsValue::from(matched))
}

fn is_resolvable(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(resolve_ipv4(&host).is_some()))
}

fn dns_resolve(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    match resolve_ipv4(&host) {
        Some(ip) => Ok(JsValue::from(JsString::from(ip.to_string()))),
        // Returning null is what Chrome and Firefox do here.
        None => {
            debug!("dnsResolve failed for host [{}]", host);
            Ok(JsValue::null())
        }
    }
}

fn my_ip_address(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    let ip = primary_local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(JsValue::from(JsString::from(ip)))
}

fn is_in_net(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let pattern = string_arg(args, 1, ctx)?;
    let mask = string_arg(args, 2, ctx)?;

    let resolved = match resolve_ipv4(&host) {
        Some(IpAddr::V4(ip)) => ip,
        _ => return Ok(JsValue::from(false)),
    };
    let matched = match (pattern.parse(), mask.parse()) {
        (Ok(network), Ok(netmask)) => Ipv4Net::with_netmask(network, netmask)
            .map(|net| net.contains(&resolved))
            .unwrap_or(false),
        _ => false,
    };
    Ok(JsValue::from(matched))
}

fn dns_domain_levels(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let levels = host.matches('.').count() as i32;
    Ok(JsValue::from(levels))
}

fn sh_exp_match(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let value = string_arg(args, 0, ctx)?;
    let glob = string_arg(args, 1, ctx)?;
    GLOB_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .matches(&value, &glob)
            .map(JsValue::from)
            .map_err(|e| JsNativeError::error().with_message(e.to_string()).into())
    })
}

fn weekday_range(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let args = string_args(args, ctx)?;
    Ok(JsValue::from(datetime::weekday_range(&args).unwrap_or_else(
        |e| {
            warn!("weekdayRange called with faulty arguments {:?}: {}", args, e);
            false
        },
    )))
}

fn date_range(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let args = string_args(args, ctx)?;
    Ok(JsValue::from(datetime::date_range(&args).unwrap_or_else(
        |e| {
            warn!("dateRange called with faulty arguments {:?}: {}", args, e);
            false
        },
    )))
}

fn time_range(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let args = string_args(args, ctx)?;
    Ok(JsValue::from(datetime::time_range(&args).unwrap_or_else(
        |e| {
            warn!("timeRange called with faulty arguments {:?}: {}", args, e);
            false
        },
    )))
}

// *************************************************************
//  Microsoft IPv6-aware extensions
// *************************************************************

fn is_resolvable_ex(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    Ok(JsValue::from(!resolve_all(&host).is_empty()))
}

fn dns_resolve_ex(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, ctx)?;
    let mut addresses = resolve_all(&host);
    addresses.sort_by_key(|ip| ip.is_ipv4());
    let result = addresses
        .first()
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    Ok(JsValue::from(JsString::from(result)))
}

fn my_ip_address_ex(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    let addresses: Vec<String> = [primary_local_ipv6(), primary_local_ip()]
        .into_iter()
        .flatten()
        .map(|ip| ip.to_string())
        .collect();
    let joined = if addresses.is_empty() {
        "127.0.0.1".to_string()
    } else {
        addresses.join(";")
    };
    Ok(JsValue::from(JsString::from(joined)))
}

fn is_in_net_ex(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let address = string_arg(args, 0, ctx)?;
    let prefix = string_arg(args, 1, ctx)?;

    let Ok(ip) = IpAddr::from_str(&address) else {
        return Ok(JsValue::from(false));
    };
    // Accept both "10.0.0.0/8" and a bare address.
    let matched = match IpNet::from_str(&prefix) {
        Ok(net) => net.contains(&ip),
        Err(_) => IpAddr::from_str(&prefix).map(|p| p == ip).unwrap_or(false),
    };
    Ok(JsValue::from(matched))
}

fn sort_ip_address_list(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let list = string_arg(args, 0, ctx)?;
    if list.trim().is_empty() {
        return Ok(JsValue::from(js_string!("")));
    }

    let mut entries: Vec<(IpAddr, String)> = Vec::new();
    for part in list.split(';') {
        let part = part.trim();
        match IpAddr::from_str(part) {
            Ok(ip) => entries.push((ip, part.to_string())),
            Err(_) => return Ok(JsValue::from(js_string!(""))),
        }
    }
    // IPv6 first, then numeric order, preserving the original spelling.
    entries.sort_by(|(a, _), (b, _)| match (a, b) {
        (IpAddr::V6(a6), IpAddr::V6(b6)) => a6.cmp(b6),
        (IpAddr::V4(a4), IpAddr::V4(b4)) => a4.cmp(b4),
        (IpAddr::V6(_), IpAddr::V4(_)) => std::cmp::Ordering::Less,
        (IpAddr::V4(_), IpAddr::V6(_)) => std::cmp::Ordering::Greater,
    });

    let joined = entries
        .into_iter()
        .map(|(_, text)| text)
        .collect::<Vec<_>>()
        .join(";");
    Ok(JsValue::from(JsString::from(joined)))
}

fn get_client_version(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(js_string!("1.0")))
}

fn alert(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let message = string_arg(args, 0, ctx)?;
    debug!("PAC script says: {}", message);
    Ok(JsValue::undefined())
}
