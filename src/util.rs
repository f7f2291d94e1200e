use std::ops::RangeFrom;

use nom::error::{make_error, ErrorKind, ParseError};
use nom::multi::length_data;
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult, InputIter, InputLength, Slice};

pub fn be_u48<I, E: ParseError<I>>(input: I) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let bound: usize = 6;

    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u64;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u64;
        }

        Ok((input.slice(bound..), res))
    }
}

/// Opaque data with a one byte length prefix.
#[inline(always)]
pub fn vec8(input: &[u8]) -> IResult<&[u8], &[u8]> {
    length_data(be_u8)(input)
}

/// Opaque data with a two byte length prefix.
#[inline(always)]
pub fn vec16(input: &[u8]) -> IResult<&[u8], &[u8]> {
    length_data(be_u16)(input)
}

/// Opaque data with a three byte length prefix.
#[inline(always)]
pub fn vec24(input: &[u8]) -> IResult<&[u8], &[u8]> {
    length_data(be_u24)(input)
}

/// Run `f` over the whole of `input`, failing if anything is left over.
pub fn all_consumed<'a, O, F>(mut f: F, input: &'a [u8]) -> IResult<&'a [u8], O>
where
    F: FnMut(&'a [u8]) -> IResult<&'a [u8], O>,
{
    let (rest, out) = f(input)?;
    if !rest.is_empty() {
        return Err(Err::Error(make_error(rest, ErrorKind::Eof)));
    }
    Ok((rest, out))
}

#[inline(always)]
pub fn put_u24(output: &mut Vec<u8>, v: usize) {
    output.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

pub fn put_vec8(output: &mut Vec<u8>, data: &[u8]) {
    output.push(data.len() as u8);
    output.extend_from_slice(data);
}

pub fn put_vec16(output: &mut Vec<u8>, data: &[u8]) {
    output.extend_from_slice(&(data.len() as u16).to_be_bytes());
    output.extend_from_slice(data);
}

pub fn put_vec24(output: &mut Vec<u8>, data: &[u8]) {
    put_u24(output, data.len());
    output.extend_from_slice(data);
}

/// Write a two byte length placeholder, call `f`, then patch in the length.
pub fn with_len16(output: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let at = output.len();
    output.extend_from_slice(&[0, 0]);
    f(output);
    let len = (output.len() - at - 2) as u16;
    output[at..at + 2].copy_from_slice(&len.to_be_bytes());
}
