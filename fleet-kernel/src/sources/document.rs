//! Mise à jour ciblée d'un champ scalaire dans un document YAML.
//!
//! Seule la ligne du champ visé est réécrite : commentaires, ordre des clés
//! et formatage du reste du fichier restent intacts. Utilisé pour les fichiers
//! maintenus à la main (conf.yml d'une source) ; les fichiers purement machine
//! passent par une réécriture complète via serde_yaml.

/// Ligne `clé: valeur` décomposée
struct KeyLine<'a> {
    indent: usize,
    key: &'a str,
    value: &'a str,
    comment: Option<&'a str>,
}

fn split_comment(rest: &str) -> (&str, Option<&str>) {
    // un commentaire commence par '#' précédé d'un blanc (ou en début de valeur)
    let bytes = rest.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return (rest[..i].trim(), Some(&rest[i..]));
        }
    }
    (rest.trim(), None)
}

fn parse_key_line(line: &str) -> Option<KeyLine<'_>> {
    let trimmed = line.trim_start_matches(' ');
    let indent = line.len() - trimmed.len();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
        return None;
    }
    let colon = trimmed.find(':')?;
    let after = &trimmed[colon + 1..];
    if !(after.is_empty() || after.starts_with(' ') || after.starts_with('\t')) {
        return None;
    }
    let key = trimmed[..colon].trim().trim_matches(|c| c == '"' || c == '\'');
    if key.is_empty() {
        return None;
    }
    let (value, comment) = split_comment(after);
    Some(KeyLine { indent, key, value, comment })
}

#[derive(Debug, Clone)]
pub struct YamlDocument {
    text: String,
}

impl YamlDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    /// Localise la ligne du chemin `path` ; retourne (index de ligne, indent)
    fn locate(&self, path: &[&str]) -> Option<usize> {
        if path.is_empty() {
            return None;
        }
        let mut stack: Vec<(usize, &str)> = Vec::new();
        for (idx, line) in self.text.split('\n').enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let Some(kl) = parse_key_line(line) else { continue };
            while stack.last().is_some_and(|(indent, _)| *indent >= kl.indent) {
                stack.pop();
            }
            let depth = stack.len();
            if depth + 1 == path.len()
                && kl.key == path[depth]
                && stack.iter().zip(path).all(|((_, k), p)| k == p)
            {
                return Some(idx);
            }
            if kl.value.is_empty() {
                stack.push((kl.indent, kl.key));
            }
        }
        None
    }

    pub fn get_scalar(&self, path: &[&str]) -> Option<String> {
        let idx = self.locate(path)?;
        let line = self.text.split('\n').nth(idx)?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        parse_key_line(line).map(|kl| kl.value.to_string())
    }

    /// Remplace la valeur du champ ; `false` si le champ est absent (document inchangé)
    pub fn set_scalar(&mut self, path: &[&str], value: &str) -> bool {
        let Some(idx) = self.locate(path) else { return false };
        let mut lines: Vec<String> = self.text.split('\n').map(str::to_string).collect();
        let original = &lines[idx];
        let (body, cr) = match original.strip_suffix('\r') {
            Some(body) => (body, "\r"),
            None => (original.as_str(), ""),
        };
        let Some(kl) = parse_key_line(body) else { return false };
        let colon = body[kl.indent..].find(':').map(|c| c + kl.indent).unwrap_or(body.len());
        let mut rebuilt = format!("{}: {}", &body[..colon], value);
        if let Some(comment) = kl.comment {
            rebuilt.push(' ');
            rebuilt.push_str(comment);
        }
        rebuilt.push_str(cr);
        lines[idx] = rebuilt;
        self.text = lines.join("\n");
        true
    }
}
