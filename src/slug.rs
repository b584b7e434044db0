/// Maximum slug length after normalization.
const MAX_SLUG_LEN: usize = 80;

/// Derive a URL slug from a (translated) title.
///
/// Normalization: fold diacritics to ASCII, lower-case, replace every
/// non-alphanumeric run with a single hyphen, trim leading/trailing hyphens
/// and cap the length. Deterministic, so the same title always yields the
/// same slug for its locale.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_was_hyphen = true; // suppress a leading hyphen

    let mut push = |slug: &mut String, last_was_hyphen: &mut bool, ch: char| {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            slug.push(lower);
            *last_was_hyphen = false;
        } else if !*last_was_hyphen {
            slug.push('-');
            *last_was_hyphen = true;
        }
    };

    for c in title.chars() {
        match fold_diacritic(c) {
            Some(ascii) => {
                for ch in ascii.chars() {
                    push(&mut slug, &mut last_was_hyphen, ch);
                }
            }
            None => push(&mut slug, &mut last_was_hyphen, c),
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    slug
}

/// Fold common accented Latin characters to their ASCII base.
///
/// Characters outside the table are left to the alphanumeric filter in
/// `slugify`, which turns them into separators.
fn fold_diacritic(c: char) -> Option<&'static str> {
    let folded = match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'å' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => "e",
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => "i",
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => "o",
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'ø' | 'Ø' => "o",
        'œ' | 'Œ' => "oe",
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_title() {
        assert_eq!(slugify("Bitcoin Hits New High"), "bitcoin-hits-new-high");
    }

    #[test]
    fn test_diacritics_folded() {
        assert_eq!(
            slugify("Bitcoin alcança nova máxima"),
            "bitcoin-alcanca-nova-maxima"
        );
        assert_eq!(slugify("Año nuevo en España"), "ano-nuevo-en-espana");
    }

    #[test]
    fn test_punctuation_collapsed_to_single_hyphen() {
        assert_eq!(slugify("Hello -- World!!!"), "hello-world");
        assert_eq!(slugify("a,b.c;d"), "a-b-c-d");
    }

    #[test]
    fn test_leading_and_trailing_separators_trimmed() {
        assert_eq!(slugify("  ¡Hola, mundo!  "), "hola-mundo");
    }

    #[test]
    fn test_length_capped() {
        let long = "word ".repeat(40);
        let slug = slugify(&long);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(slugify("Same Title"), slugify("Same Title"));
    }

    #[test]
    fn test_empty_and_symbol_only_titles() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_distinct_titles_can_collide() {
        // Collision handling is the CMS's job; slugify itself is pure.
        assert_eq!(slugify("foo bar"), slugify("Foo, Bar!"));
    }
}
