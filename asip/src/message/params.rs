use std::fmt;

use asip_util::{ArcStr, Scanner};

use crate::error::Result;

/// A single `name[=value]` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter name.
    pub name: ArcStr,
    /// Parameter value, absent for flag parameters such as `lr`.
    pub value: Option<ArcStr>,
}

/// An ordered `;name=value` parameter list.
///
/// Order is preserved on emission; lookups are case-insensitive on the
/// parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params(Vec<Param>);

impl Params {
    /// Creates an empty parameter list.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Returns the value of `name`, if present with a value.
    pub fn get(&self, name: &str) -> Option<&ArcStr> {
        self.0
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.value.as_ref())
    }

    /// Returns `true` when the parameter is present, with or without value.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Sets or replaces a parameter.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(ArcStr::from);
        if let Some(param) = self.0.iter_mut().find(|p| p.name.eq_ignore_ascii_case(name)) {
            param.value = value;
        } else {
            self.0.push(Param {
                name: name.into(),
                value,
            });
        }
    }

    /// Removes a parameter, returning its value if it had one.
    pub fn remove(&mut self, name: &str) -> Option<ArcStr> {
        let idx = self.0.iter().position(|p| p.name.eq_ignore_ascii_case(name))?;
        self.0.remove(idx).value
    }

    /// Returns an iterator over the parameters.
    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    /// Returns `true` when no parameters are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parses a `;name=value;name;...` run, stopping at any byte that
    /// cannot start a parameter.
    ///
    /// The scanner must be positioned at the first `;` (or at a byte that
    /// ends the list, in which case an empty list is returned).
    pub fn parse(scanner: &mut Scanner<'_>) -> Result<Self> {
        let mut params = Params::new();

        while scanner.peek() == Some(b';') {
            scanner.bump();

            let name = scanner.read_until_any(b"=;?&> \t\r\n,");
            if name.is_empty() {
                break;
            }
            let name = std::str::from_utf8(name)?;

            let value = if scanner.peek() == Some(b'=') {
                scanner.bump();
                let value = scanner.read_until_any(b";?&> \t\r\n,");
                Some(std::str::from_utf8(value)?)
            } else {
                None
            };

            params.set(name, value);
        }

        Ok(params)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for Param { name, value } in self.0.iter() {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl<const N: usize> From<[(&str, Option<&str>); N]> for Params {
    fn from(arr: [(&str, Option<&str>); N]) -> Self {
        let mut params = Params::new();
        for (name, value) in arr {
            params.set(name, value);
        }
        params
    }
}
