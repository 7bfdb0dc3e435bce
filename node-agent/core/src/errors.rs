use std::fmt;

/// A set of independent failures reported together.
///
/// Batch operations collect per-item failures here instead of stopping at the first one, so
/// that one item's failure never hides another's.
#[derive(Debug)]
pub struct Errors<E>(Vec<E>);

impl<E> Errors<E> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, error: E) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.0.iter()
    }

    /// Succeeds if no errors were collected.
    pub fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> Default for Errors<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> From<E> for Errors<E> {
    fn from(error: E) -> Self {
        Self(vec![error])
    }
}

impl<E> FromIterator<E> for Errors<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<E> Extend<E> for Errors<E> {
    fn extend<I: IntoIterator<Item = E>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl<E> IntoIterator for Errors<E> {
    type Item = E;
    type IntoIter = std::vec::IntoIter<E>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<E: fmt::Display> fmt::Display for Errors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            fmt::Display::fmt(error, f)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Errors<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_each_error_on_its_own_line() {
        let errors = ["first", "second"]
            .into_iter()
            .map(|e| anyhow::anyhow!(e))
            .collect::<Errors<_>>();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.to_string(), "first\nsecond");
    }

    #[test]
    fn empty_is_ok() {
        assert!(Errors::<anyhow::Error>::new().into_result().is_ok());

        let mut errors = Errors::new();
        errors.push(anyhow::anyhow!("boom"));
        assert!(errors.into_result().is_err());
    }
}
