use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

type IndexOfError = usize;

// nesting deeper than this is refused, the parser recurses once per level
const MAX_DEPTH: usize = 64;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ErrorElem {
    Unknown,
    Str,
    Int,
    List,
    Dict,
}

#[derive(PartialEq, Debug, Error)]
#[error("could not parse bencoded {elem:?} at byte {index}")]
pub struct ParseError {
    elem: ErrorElem,
    index: IndexOfError,
}

#[derive(PartialEq, Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(HashMap<Vec<u8>, Value>, usize, usize), // dict, start byte (included), end byte (excluded) in the source
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => match std::str::from_utf8(s) {
                Ok(s) => write!(f, "\"{s}\""),
                Err(_) => write!(f, "<{} binary bytes>", s.len()),
            },
            Value::Int(i) => write!(f, "{i}"),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Dict(d, _, _) => {
                let mut keys: Vec<&Vec<u8>> = d.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i != 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", String::from_utf8_lossy(k), d[*k])?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Value {
    pub fn new(source: &[u8]) -> Result<Self, ParseError> {
        Ok(Self::parse(source, 0, 0)?.0)
    }

    // return Value, index of next byte to read
    fn parse(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        match source.get(index) {
            Some(b'0'..=b'9') => Value::parse_str(source, index),
            Some(b'i') => Value::parse_int(source, index),
            Some(b'l') if depth < MAX_DEPTH => Value::parse_list(source, index, depth + 1),
            Some(b'd') if depth < MAX_DEPTH => Value::parse_dict(source, index, depth + 1),
            Some(b'l') => Err(new_error(ErrorElem::List, index)),
            Some(b'd') => Err(new_error(ErrorElem::Dict, index)),
            _ => Err(new_error(ErrorElem::Unknown, index)),
        }
    }

    fn parse_str(source: &[u8], index: usize) -> Result<(Self, usize), ParseError> {
        let colon = source[index..]
            .iter()
            .position(|b| *b == b':')
            .map(|p| index + p)
            .ok_or(new_error(ErrorElem::Str, index))?;
        let string_len = parse_ascii_number::<usize>(&source[index..colon])
            .ok_or(new_error(ErrorElem::Str, index))?;
        let start = colon + 1;
        let end = start
            .checked_add(string_len)
            .filter(|end| *end <= source.len())
            .ok_or(new_error(ErrorElem::Str, index))?;
        Ok((Value::Str(source[start..end].to_vec()), end))
    }

    fn parse_int(source: &[u8], index: usize) -> Result<(Self, usize), ParseError> {
        let end = source[index..]
            .iter()
            .position(|b| *b == b'e')
            .map(|p| index + p)
            .ok_or(new_error(ErrorElem::Int, index))?;
        let digits = &source[index + 1..end];
        // leading zeros and negative zero are not valid bencoding
        if digits.is_empty()
            || digits == b"-0"
            || (digits.len() > 1 && digits[0] == b'0')
            || digits.starts_with(b"-0")
        {
            return Err(new_error(ErrorElem::Int, index));
        }
        let value =
            parse_ascii_number::<i64>(digits).ok_or(new_error(ErrorElem::Int, index))?;
        Ok((Value::Int(value), end + 1))
    }

    fn parse_list(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        let mut list = Vec::new();
        let mut next = index + 1;
        loop {
            match source.get(next) {
                Some(b'e') => return Ok((Value::List(list), next + 1)),
                Some(_) => {
                    let (v, n) = Value::parse(source, next, depth)?;
                    list.push(v);
                    next = n;
                }
                None => return Err(new_error(ErrorElem::List, index)),
            }
        }
    }

    fn parse_dict(source: &[u8], index: usize, depth: usize) -> Result<(Self, usize), ParseError> {
        let mut dict = HashMap::new();
        let mut next = index + 1;
        loop {
            match source.get(next) {
                Some(b'e') => return Ok((Value::Dict(dict, index, next + 1), next + 1)),
                Some(_) => {
                    let (key, n) = Value::parse_str(source, next)
                        .map_err(|_| new_error(ErrorElem::Dict, next))?;
                    let (value, n) = Value::parse(source, n, depth)?;
                    if let Value::Str(k) = key {
                        dict.insert(k, value);
                    }
                    next = n;
                }
                None => return Err(new_error(ErrorElem::Dict, index)),
            }
        }
    }
}

fn new_error(elem: ErrorElem, index: IndexOfError) -> ParseError {
    ParseError { elem, index }
}

fn parse_ascii_number<T: std::str::FromStr>(digits: &[u8]) -> Option<T> {
    std::str::from_utf8(digits).ok()?.parse::<T>().ok()
}
