// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistence of decoded profiles: a textual symbolic-expression form and
//! a versioned binary form (length-prefixed fields behind an lz4 frame).
//! Both encodings write their maps in sorted key order, so output bytes are
//! deterministic, and both round-trip: `read(write(p)) = p`.

mod sexp;

pub use sexp::Sexp;

use crate::addr::Address;
use crate::collections::FxIndexMap;
use crate::crcs::{CrcKind, Crcs, CrcsConfig, DigestPolicy, Md5Digest};
use crate::error::{ProfileError, ProfileResult};
use crate::profile::{DbgLoc, DecodedProfile, Func, FuncAgg, FunctionId, Loc, RelLoc};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Identifies binary profile files.
pub const MAGIC: &[u8; 8] = b"FDOPROF\0";
/// Bumped on any change to the binary layout.
pub const VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Textual encoding
// ---------------------------------------------------------------------------

pub fn write_textual<W: Write>(profile: &DecodedProfile, writer: &mut W) -> ProfileResult<()> {
    writeln!(writer, "{}", to_sexp(profile))?;
    Ok(())
}

pub fn read_textual<R: Read>(reader: &mut R) -> ProfileResult<DecodedProfile> {
    let mut text = String::new();
    reader.read_to_string(&mut text)?;
    of_sexp(&Sexp::parse(&text)?)
}

pub fn write_textual_file(profile: &DecodedProfile, path: impl AsRef<Path>) -> ProfileResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_textual(profile, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn read_textual_file(path: impl AsRef<Path>) -> ProfileResult<DecodedProfile> {
    read_textual(&mut BufReader::new(File::open(path)?))
}

pub fn to_sexp(profile: &DecodedProfile) -> Sexp {
    let mut fields = Vec::new();
    if let Some(buildid) = &profile.buildid {
        fields.push(Sexp::field("buildid", Sexp::atom(buildid.clone())));
    }

    let mut locs: Vec<&Loc> = profile.addr2loc.values().collect();
    locs.sort_by_key(|loc| loc.addr);
    fields.push(Sexp::field(
        "addr2loc",
        Sexp::list(locs.into_iter().map(loc_to_sexp).collect()),
    ));

    let mut names: Vec<(&String, FunctionId)> = profile
        .name2id
        .iter()
        .map(|(name, &id)| (name, id))
        .collect();
    names.sort_by_key(|&(_, id)| id);
    fields.push(Sexp::field(
        "name2id",
        Sexp::list(
            names
                .into_iter()
                .map(|(name, id)| {
                    Sexp::list(vec![
                        Sexp::atom(name.clone()),
                        Sexp::atom(id.to_raw_id().to_string()),
                    ])
                })
                .collect(),
        ),
    ));

    let mut funcs: Vec<&Func> = profile.functions.values().collect();
    funcs.sort_by_key(|func| func.id);
    fields.push(Sexp::field(
        "functions",
        Sexp::list(funcs.into_iter().map(func_to_sexp).collect()),
    ));

    fields.push(Sexp::field("crcs", crcs_to_sexp(&profile.crcs)));
    Sexp::list(fields)
}

pub fn of_sexp(sexp: &Sexp) -> ProfileResult<DecodedProfile> {
    let buildid = match sexp.get("buildid")? {
        Some(value) => Some(value.as_atom()?.to_string()),
        None => None,
    };
    let crcs = crcs_of_sexp(sexp.expect("crcs")?)?;
    let mut profile = DecodedProfile::new(crcs, buildid);

    for item in sexp.expect("addr2loc")?.as_list()? {
        let loc = loc_of_sexp(item)?;
        profile.addr2loc.insert(loc.addr, loc);
    }
    for item in sexp.expect("name2id")?.as_list()? {
        let pair = item.as_list()?;
        let [name, id] = pair else {
            return Err(ProfileError::malformed("bad name2id pair"));
        };
        profile.name2id.insert(
            name.as_atom()?.to_string(),
            FunctionId::from_offset(parse_u32(id)? as usize),
        );
    }
    for item in sexp.expect("functions")?.as_list()? {
        let func = func_of_sexp(item)?;
        profile.functions.insert(func.id, func);
    }
    Ok(profile)
}

fn loc_to_sexp(loc: &Loc) -> Sexp {
    let mut fields = vec![Sexp::field("addr", hex_atom(loc.addr))];
    if let Some(rel) = &loc.rel {
        let mut rel_fields = vec![
            Sexp::field("id", Sexp::atom(rel.id.to_raw_id().to_string())),
            Sexp::field("offset", Sexp::atom(rel.offset.to_string())),
        ];
        if let Some(label) = rel.label {
            rel_fields.push(Sexp::field("label", Sexp::atom(label.to_string())));
        }
        fields.push(Sexp::field("rel", Sexp::list(rel_fields)));
    }
    if let Some(dbg) = &loc.dbg {
        fields.push(Sexp::field(
            "dbg",
            Sexp::list(vec![
                Sexp::field("file", Sexp::atom(dbg.file.clone())),
                Sexp::field("line", Sexp::atom(dbg.line.to_string())),
            ]),
        ));
    }
    Sexp::list(fields)
}

fn loc_of_sexp(sexp: &Sexp) -> ProfileResult<Loc> {
    let addr = parse_hex(sexp.expect("addr")?)?;
    let rel = match sexp.get("rel")? {
        Some(rel) => Some(RelLoc {
            id: FunctionId::from_offset(parse_u32(rel.expect("id")?)? as usize),
            offset: parse_u32(rel.expect("offset")?)?,
            label: match rel.get("label")? {
                Some(label) => Some(parse_u32(label)?),
                None => None,
            },
        }),
        None => None,
    };
    let dbg = match sexp.get("dbg")? {
        Some(dbg) => Some(DbgLoc {
            file: dbg.expect("file")?.as_atom()?.to_string(),
            line: parse_u32(dbg.expect("line")?)?,
        }),
        None => None,
    };
    Ok(Loc { addr, rel, dbg })
}

fn func_to_sexp(func: &Func) -> Sexp {
    Sexp::list(vec![
        Sexp::field("id", Sexp::atom(func.id.to_raw_id().to_string())),
        Sexp::field("name", Sexp::atom(func.name.clone())),
        Sexp::field("start", hex_atom(func.start)),
        Sexp::field("finish", hex_atom(func.finish)),
        Sexp::field("has_linearids", bool_atom(func.has_linearids)),
        Sexp::field("count", Sexp::atom(func.count.to_string())),
        Sexp::field(
            "malformed_traces",
            Sexp::atom(func.malformed_traces.to_string()),
        ),
        Sexp::field(
            "agg",
            Sexp::list(vec![
                Sexp::field("instructions", addr_map_to_sexp(&func.agg.instructions)),
                Sexp::field("branches", pair_map_to_sexp(&func.agg.branches)),
                Sexp::field("mispredicts", pair_map_to_sexp(&func.agg.mispredicts)),
                Sexp::field("traces", pair_map_to_sexp(&func.agg.traces)),
            ]),
        ),
    ])
}

fn func_of_sexp(sexp: &Sexp) -> ProfileResult<Func> {
    let agg = sexp.expect("agg")?;
    Ok(Func {
        id: FunctionId::from_offset(parse_u32(sexp.expect("id")?)? as usize),
        name: sexp.expect("name")?.as_atom()?.to_string(),
        start: parse_hex(sexp.expect("start")?)?,
        finish: parse_hex(sexp.expect("finish")?)?,
        has_linearids: parse_bool(sexp.expect("has_linearids")?)?,
        count: parse_u64(sexp.expect("count")?)?,
        malformed_traces: parse_u64(sexp.expect("malformed_traces")?)?,
        agg: FuncAgg {
            instructions: addr_map_of_sexp(agg.expect("instructions")?)?,
            branches: pair_map_of_sexp(agg.expect("branches")?)?,
            mispredicts: pair_map_of_sexp(agg.expect("mispredicts")?)?,
            traces: pair_map_of_sexp(agg.expect("traces")?)?,
        },
    })
}

fn crcs_to_sexp(crcs: &Crcs) -> Sexp {
    let config = crcs.config();
    let config_sexp = Sexp::list(vec![
        Sexp::field("unit", bool_atom(config.unit)),
        Sexp::field("func", bool_atom(config.func)),
        Sexp::field("ignore_dbg", bool_atom(config.ignore_dbg)),
        Sexp::field("on_missing", Sexp::atom(config.on_missing.to_string())),
        Sexp::field("on_mismatch", Sexp::atom(config.on_mismatch.to_string())),
    ]);
    let mut entries: Vec<(&str, CrcKind, &Md5Digest)> = crcs.iter().collect();
    entries.sort_by_key(|&(name, _, _)| name);
    Sexp::list(vec![
        Sexp::field("config", config_sexp),
        Sexp::field(
            "entries",
            Sexp::list(
                entries
                    .into_iter()
                    .map(|(name, kind, digest)| {
                        Sexp::list(vec![
                            Sexp::field("name", Sexp::atom(name)),
                            Sexp::field("kind", Sexp::atom(kind.to_string())),
                            Sexp::field("digest", Sexp::atom(digest.to_string())),
                        ])
                    })
                    .collect(),
            ),
        ),
    ])
}

fn crcs_of_sexp(sexp: &Sexp) -> ProfileResult<Crcs> {
    let config = sexp.expect("config")?;
    let config = CrcsConfig::new(
        parse_bool(config.expect("unit")?)?,
        parse_bool(config.expect("func")?)?,
        parse_bool(config.expect("ignore_dbg")?)?,
        config.expect("on_missing")?.as_atom()?.parse()?,
        config.expect("on_mismatch")?.as_atom()?.parse()?,
    )?;
    let mut crcs = Crcs::new(config);
    for entry in sexp.expect("entries")?.as_list()? {
        crcs.insert_unchecked(
            entry.expect("name")?.as_atom()?.to_string(),
            entry.expect("kind")?.as_atom()?.parse()?,
            entry.expect("digest")?.as_atom()?.parse()?,
        );
    }
    Ok(crcs)
}

fn addr_map_to_sexp(map: &FxIndexMap<Address, u64>) -> Sexp {
    let mut entries: Vec<(Address, u64)> = map.iter().map(|(&a, &c)| (a, c)).collect();
    entries.sort_unstable();
    Sexp::list(
        entries
            .into_iter()
            .map(|(addr, count)| Sexp::list(vec![hex_atom(addr), Sexp::atom(count.to_string())]))
            .collect(),
    )
}

fn addr_map_of_sexp(sexp: &Sexp) -> ProfileResult<FxIndexMap<Address, u64>> {
    let mut map = FxIndexMap::default();
    for item in sexp.as_list()? {
        let [addr, count] = item.as_list()? else {
            return Err(ProfileError::malformed("bad counter entry"));
        };
        map.insert(parse_hex(addr)?, parse_u64(count)?);
    }
    Ok(map)
}

fn pair_map_to_sexp(map: &FxIndexMap<(Address, Address), u64>) -> Sexp {
    let mut entries: Vec<((Address, Address), u64)> = map.iter().map(|(&k, &c)| (k, c)).collect();
    entries.sort_unstable();
    Sexp::list(
        entries
            .into_iter()
            .map(|((from, to), count)| {
                Sexp::list(vec![
                    Sexp::list(vec![hex_atom(from), hex_atom(to)]),
                    Sexp::atom(count.to_string()),
                ])
            })
            .collect(),
    )
}

fn pair_map_of_sexp(sexp: &Sexp) -> ProfileResult<FxIndexMap<(Address, Address), u64>> {
    let mut map = FxIndexMap::default();
    for item in sexp.as_list()? {
        let [pair, count] = item.as_list()? else {
            return Err(ProfileError::malformed("bad counter entry"));
        };
        let [from, to] = pair.as_list()? else {
            return Err(ProfileError::malformed("bad address pair"));
        };
        map.insert((parse_hex(from)?, parse_hex(to)?), parse_u64(count)?);
    }
    Ok(map)
}

fn hex_atom(addr: Address) -> Sexp {
    Sexp::atom(format!("{addr:#x}"))
}

fn bool_atom(b: bool) -> Sexp {
    Sexp::atom(if b { "true" } else { "false" })
}

fn parse_hex(sexp: &Sexp) -> ProfileResult<Address> {
    let text = sexp.as_atom()?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    Address::from_str_radix(digits, 16)
        .map_err(|_| ProfileError::malformed(format!("bad address {text:?}")))
}

fn parse_u64(sexp: &Sexp) -> ProfileResult<u64> {
    let text = sexp.as_atom()?;
    text.parse()
        .map_err(|_| ProfileError::malformed(format!("bad number {text:?}")))
}

fn parse_u32(sexp: &Sexp) -> ProfileResult<u32> {
    let text = sexp.as_atom()?;
    text.parse()
        .map_err(|_| ProfileError::malformed(format!("bad number {text:?}")))
}

fn parse_bool(sexp: &Sexp) -> ProfileResult<bool> {
    match sexp.as_atom()? {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ProfileError::malformed(format!("bad bool {other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Binary encoding
// ---------------------------------------------------------------------------

pub fn write_binary<W: Write>(profile: &DecodedProfile, writer: &mut W) -> ProfileResult<()> {
    writer.write_all(MAGIC)?;
    writer.write_u16::<LittleEndian>(VERSION)?;
    let mut body = FrameEncoder::new(writer);
    write_body(profile, &mut body)?;
    body.finish()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(())
}

pub fn read_binary<R: Read>(reader: &mut R) -> ProfileResult<DecodedProfile> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ProfileError::malformed("not a binary profile"));
    }
    let version = reader.read_u16::<LittleEndian>()?;
    if version != VERSION {
        return Err(ProfileError::IncompatibleVersion {
            expected: VERSION,
            found: version,
        });
    }
    read_body(&mut FrameDecoder::new(reader))
}

pub fn write_binary_file(profile: &DecodedProfile, path: impl AsRef<Path>) -> ProfileResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_binary(profile, &mut writer)?;
    writer.flush()?;
    Ok(())
}

pub fn read_binary_file(path: impl AsRef<Path>) -> ProfileResult<DecodedProfile> {
    read_binary(&mut BufReader::new(File::open(path)?))
}

fn write_body<W: Write>(profile: &DecodedProfile, w: &mut W) -> ProfileResult<()> {
    write_opt_str(w, profile.buildid.as_deref())?;

    let mut locs: Vec<&Loc> = profile.addr2loc.values().collect();
    locs.sort_by_key(|loc| loc.addr);
    w.write_u64::<LittleEndian>(locs.len() as u64)?;
    for loc in locs {
        w.write_u64::<LittleEndian>(loc.addr)?;
        match &loc.rel {
            None => w.write_u8(0)?,
            Some(rel) => {
                w.write_u8(1)?;
                w.write_u32::<LittleEndian>(rel.id.to_raw_id())?;
                w.write_u32::<LittleEndian>(rel.offset)?;
                match rel.label {
                    None => w.write_u8(0)?,
                    Some(label) => {
                        w.write_u8(1)?;
                        w.write_u32::<LittleEndian>(label)?;
                    }
                }
            }
        }
        match &loc.dbg {
            None => w.write_u8(0)?,
            Some(dbg) => {
                w.write_u8(1)?;
                write_str(w, &dbg.file)?;
                w.write_u32::<LittleEndian>(dbg.line)?;
            }
        }
    }

    let mut names: Vec<(&String, FunctionId)> = profile
        .name2id
        .iter()
        .map(|(name, &id)| (name, id))
        .collect();
    names.sort_by_key(|&(_, id)| id);
    w.write_u64::<LittleEndian>(names.len() as u64)?;
    for (name, id) in names {
        write_str(w, name)?;
        w.write_u32::<LittleEndian>(id.to_raw_id())?;
    }

    let mut funcs: Vec<&Func> = profile.functions.values().collect();
    funcs.sort_by_key(|func| func.id);
    w.write_u64::<LittleEndian>(funcs.len() as u64)?;
    for func in funcs {
        w.write_u32::<LittleEndian>(func.id.to_raw_id())?;
        write_str(w, &func.name)?;
        w.write_u64::<LittleEndian>(func.start)?;
        w.write_u64::<LittleEndian>(func.finish)?;
        w.write_u8(func.has_linearids as u8)?;
        w.write_u64::<LittleEndian>(func.count)?;
        w.write_u64::<LittleEndian>(func.malformed_traces)?;
        write_addr_map(w, &func.agg.instructions)?;
        write_pair_map(w, &func.agg.branches)?;
        write_pair_map(w, &func.agg.mispredicts)?;
        write_pair_map(w, &func.agg.traces)?;
    }

    let config = profile.crcs.config();
    w.write_u8(config.unit as u8)?;
    w.write_u8(config.func as u8)?;
    w.write_u8(config.ignore_dbg as u8)?;
    w.write_u8(policy_tag(config.on_missing))?;
    w.write_u8(policy_tag(config.on_mismatch))?;
    let mut entries: Vec<(&str, CrcKind, &Md5Digest)> = profile.crcs.iter().collect();
    entries.sort_by_key(|&(name, _, _)| name);
    w.write_u64::<LittleEndian>(entries.len() as u64)?;
    for (name, kind, digest) in entries {
        write_str(w, name)?;
        w.write_u8(match kind {
            CrcKind::Unit => 0,
            CrcKind::Func => 1,
        })?;
        w.write_all(digest.as_bytes())?;
    }
    Ok(())
}

fn read_body<R: Read>(r: &mut R) -> ProfileResult<DecodedProfile> {
    let buildid = read_opt_str(r)?;

    let mut addr2loc = FxIndexMap::default();
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let addr = r.read_u64::<LittleEndian>()?;
        let rel = match r.read_u8()? {
            0 => None,
            1 => {
                let id = FunctionId::from_offset(r.read_u32::<LittleEndian>()? as usize);
                let offset = r.read_u32::<LittleEndian>()?;
                let label = match r.read_u8()? {
                    0 => None,
                    1 => Some(r.read_u32::<LittleEndian>()?),
                    tag => return Err(bad_tag("label", tag)),
                };
                Some(RelLoc { id, offset, label })
            }
            tag => return Err(bad_tag("rel", tag)),
        };
        let dbg = match r.read_u8()? {
            0 => None,
            1 => Some(DbgLoc {
                file: read_str(r)?,
                line: r.read_u32::<LittleEndian>()?,
            }),
            tag => return Err(bad_tag("dbg", tag)),
        };
        addr2loc.insert(addr, Loc { addr, rel, dbg });
    }

    let mut name2id = FxIndexMap::default();
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let name = read_str(r)?;
        let id = FunctionId::from_offset(r.read_u32::<LittleEndian>()? as usize);
        name2id.insert(name, id);
    }

    let mut functions = FxIndexMap::default();
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let id = FunctionId::from_offset(r.read_u32::<LittleEndian>()? as usize);
        let name = read_str(r)?;
        let start = r.read_u64::<LittleEndian>()?;
        let finish = r.read_u64::<LittleEndian>()?;
        let has_linearids = match r.read_u8()? {
            0 => false,
            1 => true,
            tag => return Err(bad_tag("has_linearids", tag)),
        };
        let count = r.read_u64::<LittleEndian>()?;
        let malformed_traces = r.read_u64::<LittleEndian>()?;
        let agg = FuncAgg {
            instructions: read_addr_map(r)?,
            branches: read_pair_map(r)?,
            mispredicts: read_pair_map(r)?,
            traces: read_pair_map(r)?,
        };
        functions.insert(
            id,
            Func {
                id,
                name,
                start,
                finish,
                has_linearids,
                count,
                malformed_traces,
                agg,
            },
        );
    }

    let unit = r.read_u8()? != 0;
    let func = r.read_u8()? != 0;
    let ignore_dbg = r.read_u8()? != 0;
    let on_missing = policy_of_tag(r.read_u8()?)?;
    let on_mismatch = policy_of_tag(r.read_u8()?)?;
    let mut crcs = Crcs::new(CrcsConfig::new(
        unit,
        func,
        ignore_dbg,
        on_missing,
        on_mismatch,
    )?);
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let name = read_str(r)?;
        let kind = match r.read_u8()? {
            0 => CrcKind::Unit,
            1 => CrcKind::Func,
            tag => return Err(bad_tag("digest kind", tag)),
        };
        let mut digest = [0u8; 16];
        r.read_exact(&mut digest)?;
        crcs.insert_unchecked(name, kind, Md5Digest::new(digest));
    }

    let mut profile = DecodedProfile::new(crcs, buildid);
    profile.addr2loc = addr2loc;
    profile.name2id = name2id;
    profile.functions = functions;
    Ok(profile)
}

fn write_addr_map<W: Write>(w: &mut W, map: &FxIndexMap<Address, u64>) -> ProfileResult<()> {
    let mut entries: Vec<(Address, u64)> = map.iter().map(|(&a, &c)| (a, c)).collect();
    entries.sort_unstable();
    w.write_u64::<LittleEndian>(entries.len() as u64)?;
    for (addr, count) in entries {
        w.write_u64::<LittleEndian>(addr)?;
        w.write_u64::<LittleEndian>(count)?;
    }
    Ok(())
}

fn read_addr_map<R: Read>(r: &mut R) -> ProfileResult<FxIndexMap<Address, u64>> {
    let mut map = FxIndexMap::default();
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let addr = r.read_u64::<LittleEndian>()?;
        let count = r.read_u64::<LittleEndian>()?;
        map.insert(addr, count);
    }
    Ok(map)
}

fn write_pair_map<W: Write>(
    w: &mut W,
    map: &FxIndexMap<(Address, Address), u64>,
) -> ProfileResult<()> {
    let mut entries: Vec<((Address, Address), u64)> = map.iter().map(|(&k, &c)| (k, c)).collect();
    entries.sort_unstable();
    w.write_u64::<LittleEndian>(entries.len() as u64)?;
    for ((from, to), count) in entries {
        w.write_u64::<LittleEndian>(from)?;
        w.write_u64::<LittleEndian>(to)?;
        w.write_u64::<LittleEndian>(count)?;
    }
    Ok(())
}

fn read_pair_map<R: Read>(r: &mut R) -> ProfileResult<FxIndexMap<(Address, Address), u64>> {
    let mut map = FxIndexMap::default();
    for _ in 0..r.read_u64::<LittleEndian>()? {
        let from = r.read_u64::<LittleEndian>()?;
        let to = r.read_u64::<LittleEndian>()?;
        let count = r.read_u64::<LittleEndian>()?;
        map.insert((from, to), count);
    }
    Ok(map)
}

fn write_str<W: Write>(w: &mut W, text: &str) -> ProfileResult<()> {
    let len: u32 = text
        .len()
        .try_into()
        .map_err(|_| ProfileError::internal("string too long to serialize"))?;
    w.write_u32::<LittleEndian>(len)?;
    w.write_all(text.as_bytes())?;
    Ok(())
}

fn read_str<R: Read>(r: &mut R) -> ProfileResult<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ProfileError::malformed("invalid utf-8 in string"))
}

fn write_opt_str<W: Write>(w: &mut W, text: Option<&str>) -> ProfileResult<()> {
    match text {
        None => {
            w.write_u8(0)?;
            Ok(())
        }
        Some(text) => {
            w.write_u8(1)?;
            write_str(w, text)
        }
    }
}

fn read_opt_str<R: Read>(r: &mut R) -> ProfileResult<Option<String>> {
    match r.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(read_str(r)?)),
        tag => Err(bad_tag("optional string", tag)),
    }
}

fn policy_tag(policy: DigestPolicy) -> u8 {
    match policy {
        DigestPolicy::Fail => 0,
        DigestPolicy::Skip => 1,
        DigestPolicy::UseAnyway => 2,
    }
}

fn policy_of_tag(tag: u8) -> ProfileResult<DigestPolicy> {
    match tag {
        0 => Ok(DigestPolicy::Fail),
        1 => Ok(DigestPolicy::Skip),
        2 => Ok(DigestPolicy::UseAnyway),
        other => Err(bad_tag("digest policy", other)),
    }
}

fn bad_tag(what: &str, tag: u8) -> ProfileError {
    ProfileError::malformed(format!("bad {what} tag {tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecoderConfig, OverflowPolicy};
    use crate::elf::StaticElfView;
    use crate::profile::decode;
    use crate::raw::{AggregatedRawProfile, PidFilter};
    use anyhow::Context;
    use std::io::Cursor;

    fn sample_profile() -> DecodedProfile {
        let mut elf = StaticElfView::new(Some("bid-7".into()));
        elf.add_function("crunch::f", 0x400000, 0x400800).unwrap();
        elf.add_function("crunch::g", 0x400800, 0x401000).unwrap();
        elf.add_line(0x400500, "crunch.linear", 12);
        let (agg, _) = AggregatedRawProfile::read_and_aggregate(
            Cursor::new(
                "7 0x400500 0x400480/0x400500/M/X/A/3\n\
                 7 0x400900 0x400500/0x400900/P/X/A/5\n\
                 7 0x999999\n",
            ),
            PidFilter::Any,
            OverflowPolicy::Saturate,
            None,
        )
        .unwrap();
        let mut crcs = Crcs::new(CrcsConfig::default());
        crcs.add("crunch", CrcKind::Unit, Md5Digest::of_parts(&[b"unit-ir"]))
            .unwrap();
        crcs.add(
            "crunch::f",
            CrcKind::Func,
            Md5Digest::of_parts(&[b"func-ir"]),
        )
        .unwrap();
        decode(&agg, &elf, crcs, &DecoderConfig::default()).unwrap()
    }

    #[test]
    fn textual_roundtrip() {
        let profile = sample_profile();
        let mut buffer = Vec::new();
        write_textual(&profile, &mut buffer).unwrap();
        let back = read_textual(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn binary_roundtrip() {
        let profile = sample_profile();
        let mut buffer = Vec::new();
        write_binary(&profile, &mut buffer).unwrap();
        let back = read_binary(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn cross_conversion_through_sexp() {
        let profile = sample_profile();
        assert_eq!(of_sexp(&to_sexp(&profile)).unwrap(), profile);
    }

    #[test]
    fn textual_output_is_deterministic() {
        let profile = sample_profile();
        let mut first = Vec::new();
        let mut second = Vec::new();
        write_textual(&profile, &mut first).unwrap();
        write_textual(&profile, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = read_binary(&mut Cursor::new(b"NOTPROF\0rest")).unwrap_err();
        assert!(matches!(err, ProfileError::MalformedProfile(_)));
    }

    #[test]
    fn wrong_version_is_incompatible() {
        let profile = sample_profile();
        let mut buffer = Vec::new();
        write_binary(&profile, &mut buffer).unwrap();
        buffer[8] = 0xff;
        let err = read_binary(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, ProfileError::IncompatibleVersion { .. }));
    }

    #[test]
    fn truncated_binary_fails_cleanly() {
        let profile = sample_profile();
        let mut buffer = Vec::new();
        write_binary(&profile, &mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);
        assert!(read_binary(&mut Cursor::new(&buffer)).is_err());
    }

    #[test]
    fn file_helpers_roundtrip() -> anyhow::Result<()> {
        let profile = sample_profile();
        let dir = tempfile::tempdir()?;
        let textual = dir.path().join("profile.fdo-txt");
        let binary = dir.path().join("profile.fdo");
        write_textual_file(&profile, &textual).context("writing textual profile")?;
        write_binary_file(&profile, &binary).context("writing binary profile")?;
        assert_eq!(read_textual_file(&textual)?, profile);
        assert_eq!(read_binary_file(&binary)?, profile);
        Ok(())
    }
}
