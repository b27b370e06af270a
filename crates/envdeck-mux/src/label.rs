use std::fmt;

/// A tab label split into its base text and optional ` #N` suffix.
///
/// Labels are compared structurally so `Shell` and `Shell2` never count as
/// the same family, while `Shell` and `Shell #3` do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabLabel {
    pub base: String,
    pub suffix: Option<u32>,
}

impl TabLabel {
    pub fn parse(input: &str) -> Self {
        if let Some((base, tail)) = input.rsplit_once(" #") {
            if !base.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = tail.parse::<u32>() {
                    if n >= 2 {
                        return Self {
                            base: base.to_string(),
                            suffix: Some(n),
                        };
                    }
                }
            }
        }
        Self {
            base: input.to_string(),
            suffix: None,
        }
    }

    pub fn with_suffix(base: &str, suffix: Option<u32>) -> Self {
        Self {
            base: base.to_string(),
            suffix,
        }
    }

    pub fn same_family(&self, other: &TabLabel) -> bool {
        self.base == other.base
    }

    /// Ordinal within its family: the bare label is 1, ` #N` is N.
    pub fn ordinal(&self) -> u32 {
        self.suffix.unwrap_or(1)
    }
}

impl fmt::Display for TabLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.suffix {
            Some(n) => write!(f, "{} #{n}", self.base),
            None => f.write_str(&self.base),
        }
    }
}

/// Picks the label for a new member of `base`'s family given the labels of
/// the live sessions. The first member keeps the bare label; later ones get
/// ` #N` with N = matches + 1, bumped past any ordinal already taken.
pub fn next_label<'a, I>(base: &str, live: I) -> TabLabel
where
    I: IntoIterator<Item = &'a str>,
{
    let wanted = TabLabel::parse(base);
    let taken: Vec<u32> = live
        .into_iter()
        .map(TabLabel::parse)
        .filter(|label| label.same_family(&wanted))
        .map(|label| label.ordinal())
        .collect();
    if taken.is_empty() {
        return TabLabel::with_suffix(&wanted.base, None);
    }
    let mut n = taken.len() as u32 + 1;
    while taken.contains(&n) {
        n += 1;
    }
    TabLabel::with_suffix(&wanted.base, Some(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_numeric_suffix() {
        assert_eq!(
            TabLabel::parse("Shell — api #3"),
            TabLabel::with_suffix("Shell — api", Some(3))
        );
        assert_eq!(TabLabel::parse("Shell"), TabLabel::with_suffix("Shell", None));
        assert_eq!(TabLabel::parse("Ticket #abc").suffix, None);
        assert_eq!(TabLabel::parse("#4").suffix, None);
        assert_eq!(TabLabel::parse("Job #1").suffix, None);
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(TabLabel::with_suffix("X", Some(2)).to_string(), "X #2");
        assert_eq!(TabLabel::with_suffix("X", None).to_string(), "X");
    }

    #[test]
    fn next_label_counts_only_same_family() {
        let live = ["Shell", "Shell2", "Shell #2"];
        assert_eq!(next_label("Shell", live).to_string(), "Shell #3");
        assert_eq!(next_label("Shell2", live).to_string(), "Shell2 #2");
        assert_eq!(next_label("Other", live).to_string(), "Other");
    }

    #[test]
    fn next_label_skips_ordinals_in_use() {
        let live = ["X", "X #3"];
        assert_eq!(next_label("X", live).to_string(), "X #4");
    }
}
