/// True when `s` is a dotted quad: four segments of ASCII digits, each
/// within 0..=255. Leading zeros are not normalised, IPv6 is never accepted.
pub fn is_literal_ipv4(s: &str) -> bool {
    let segments = s.split('.').collect::<Vec<_>>();
    if segments.len() != 4 {
        return false;
    }

    segments.iter().all(|seg| {
        !seg.is_empty()
            && seg.bytes().all(|b| b.is_ascii_digit())
            && seg.parse::<u32>().is_ok_and(|v| v <= 255)
    })
}
