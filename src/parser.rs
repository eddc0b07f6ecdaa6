//! Small nom parsers for the two plain-text formats the core has to read:
//! cdimage's `SHA256SUMS` and the `tag=value` shape of `version_detail`.

use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, space1},
    combinator::{map, opt, verify},
    multi::many1,
    sequence::{separated_pair, terminated},
    IResult, Parser,
};

fn is_hex_digit(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

#[inline]
fn digest(input: &[u8]) -> IResult<&[u8], &[u8]> {
    verify(take_while1(is_hex_digit), |d: &[u8]| d.len() == 64).parse(input)
}

#[inline]
fn filename(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_until("\n")(input)
}

/// One `sha256sum`-style line: `<64 hex chars>  [*]<filename>`.
#[inline]
fn sums_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, hash) = digest(input)?;
    let (input, _) = space1(input)?;
    let (input, _) = opt(char('*')).parse(input)?;
    let (input, name) = filename(input)?;
    Ok((input, (hash, name)))
}

#[inline]
fn sums_file(input: &[u8]) -> IResult<&[u8], Vec<(&[u8], &[u8])>> {
    many1(terminated(sums_line, tag("\n"))).parse(input)
}

/// Parses a whole `SHA256SUMS` file into `(hash, filename)` pairs.
pub fn parse_sha256sums(content: &str) -> Vec<(String, String)> {
    let mut normalized = content.to_string();
    if !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    match sums_file(normalized.as_bytes()) {
        Ok((_, pairs)) => pairs
            .into_iter()
            .map(|(h, n)| (String::from_utf8_lossy(h).into_owned(), String::from_utf8_lossy(n).into_owned()))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Looks up the hash for one filename inside a `SHA256SUMS` file's raw
/// content, without allocating the full parsed table when only one
/// lookup is needed.
pub fn sha256sums_lookup(content: &str, target_filename: &str) -> Option<String> {
    parse_sha256sums(content)
        .into_iter()
        .find(|(_, name)| name == target_filename || name.ends_with(&format!("/{target_filename}")))
        .map(|(hash, _)| hash)
}

/// One `tag=value` entry within a comma-joined `version_detail` string.
#[inline]
fn tag_value(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    separated_pair(
        take_while1(|c: u8| c != b'=' && c != b','),
        char('='),
        take_while1(|c: u8| c != b','),
    )
    .parse(input)
}

pub fn parse_version_detail_tag(entry: &str) -> Option<(String, String)> {
    map(tag_value, |(k, v)| {
        (
            String::from_utf8_lossy(k).into_owned(),
            String::from_utf8_lossy(v).into_owned(),
        )
    })
    .parse(entry.as_bytes())
    .ok()
    .map(|(_, pair)| pair)
}

#[test]
fn test_parse_sha256sums_two_space_format() {
    let content = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  empty.txt\n\
                    aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa  other.tar.gz\n";
    let parsed = parse_sha256sums(content);
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].1, "empty.txt");
}

#[test]
fn test_sha256sums_lookup_by_suffix() {
    let content = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855  build/rootfs.tar.gz\n";
    let hash = sha256sums_lookup(content, "rootfs.tar.gz").unwrap();
    assert_eq!(hash, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
}

#[test]
fn test_parse_version_detail_tag() {
    let (tag, value) = parse_version_detail_tag("ubuntu=20210714").unwrap();
    assert_eq!(tag, "ubuntu");
    assert_eq!(value, "20210714");
}
