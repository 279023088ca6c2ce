// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 fxcorr contributors

//! Per-input equaliser values.
//!
//! The control surface accepts a single complex gain, a full
//! channel-by-channel sequence, or a polynomial over the channel index.
//! All three expand to a length-`n_chans` vector of quantised complex
//! gains at write time; the board brams hold 16-bit real/imaginary pairs.

use std::fmt;

use crate::error::{Error, Result};

/// One complex gain, as quantised for the board (16-bit parts).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gain {
    pub re: f64,
    pub im: f64,
}

impl Gain {
    pub fn real(re: f64) -> Self {
        Gain { re, im: 0.0 }
    }

    /// Parse `300`, `300.5`, `4+2j` or `4-2j`.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::config("gain", format!("'{s}' is not a gain value"));
        let s = s.trim();
        if let Some(body) = s.strip_suffix('j').or_else(|| s.strip_suffix('i')) {
            // find the sign splitting real from imaginary, skipping a
            // leading sign on the real part
            let split = body
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == '+' || *c == '-')
                .map(|(i, _)| i);
            match split {
                Some(i) => {
                    let re: f64 = body[..i].parse().map_err(|_| bad())?;
                    let im: f64 = body[i..].parse().map_err(|_| bad())?;
                    Ok(Gain { re, im })
                }
                // bare imaginary, e.g. "2j"
                None => {
                    let im: f64 = body.parse().map_err(|_| bad())?;
                    Ok(Gain { re: 0.0, im })
                }
            }
        } else {
            let re: f64 = s.parse().map_err(|_| bad())?;
            Ok(Gain::real(re))
        }
    }

    /// Round to the 16-bit integer bram format.
    pub fn quantise(&self) -> Gain {
        let clamp = |v: f64| v.round().clamp(i16::MIN as f64, i16::MAX as f64);
        Gain {
            re: clamp(self.re),
            im: clamp(self.im),
        }
    }

    /// The packed 32-bit bram word: real in the high half.
    pub fn to_word(&self) -> u32 {
        let q = self.quantise();
        (((q.re as i16) as u16 as u32) << 16) | ((q.im as i16) as u16 as u32)
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_part = |v: f64| {
            if v.fract() == 0.0 {
                format!("{}", v as i64)
            } else {
                format!("{v}")
            }
        };
        if self.im == 0.0 {
            write!(f, "{}", fmt_part(self.re))
        } else if self.im < 0.0 {
            write!(f, "{}{}j", fmt_part(self.re), fmt_part(self.im))
        } else {
            write!(f, "{}+{}j", fmt_part(self.re), fmt_part(self.im))
        }
    }
}

/// An equaliser specification before expansion.
#[derive(Debug, Clone, PartialEq)]
pub enum Eq {
    /// One gain broadcast to every channel.
    Scalar(Gain),
    /// One gain per channel; length must equal `n_chans`.
    Vector(Vec<Gain>),
    /// Real polynomial coefficients, highest order first, evaluated over
    /// the channel index.
    Polynomial(Vec<f64>),
}

impl Eq {
    /// Interpret verb arguments: one value is a scalar, `n_chans` values
    /// are a per-channel vector, any other count is a polynomial.
    pub fn from_args(args: &[String], n_chans: usize) -> Result<Self> {
        if args.is_empty() {
            return Err(Error::config("gain", "no equaliser values given"));
        }
        if args.len() == 1 {
            return Ok(Eq::Scalar(Gain::parse(&args[0])?));
        }
        if args.len() == n_chans {
            let gains = args
                .iter()
                .map(|a| Gain::parse(a))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Eq::Vector(gains));
        }
        let coeffs = args
            .iter()
            .map(|a| {
                a.parse::<f64>()
                    .map_err(|_| Error::config("gain", format!("'{a}' is not a coefficient")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Eq::Polynomial(coeffs))
    }

    /// Build from configuration polynomial coefficients.
    pub fn from_poly(coeffs: &[f64]) -> Self {
        if coeffs.len() == 1 {
            Eq::Scalar(Gain::real(coeffs[0]))
        } else {
            Eq::Polynomial(coeffs.to_vec())
        }
    }

    /// Expand to a quantised length-`n_chans` vector.
    pub fn normalise(&self, n_chans: usize) -> Result<Vec<Gain>> {
        match self {
            Eq::Scalar(g) => Ok(vec![g.quantise(); n_chans]),
            Eq::Vector(v) => {
                if v.len() != n_chans {
                    return Err(Error::config(
                        "gain",
                        format!("expected {} channel values, got {}", n_chans, v.len()),
                    ));
                }
                Ok(v.iter().map(Gain::quantise).collect())
            }
            Eq::Polynomial(coeffs) => {
                let mut out = Vec::with_capacity(n_chans);
                for chan in 0..n_chans {
                    let x = chan as f64;
                    let mut acc = 0.0;
                    for c in coeffs {
                        acc = acc * x + c;
                    }
                    out.push(Gain::real(acc).quantise());
                }
                Ok(out)
            }
        }
    }
}

impl fmt::Display for Eq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eq::Scalar(g) => write!(f, "{g}"),
            Eq::Vector(v) => {
                let parts: Vec<String> = v.iter().map(|g| g.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
            Eq::Polynomial(c) => {
                let parts: Vec<String> = c.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}
