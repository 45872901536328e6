//! Block-scoped patching of a site file the certificate tool may have edited.
//!
//! The file is tokenized just far enough to find statement and brace
//! boundaries (quotes, comments and `${var}` are honoured). Nothing is
//! re-serialized: a patch is a single insertion inside one server block, so
//! every byte outside that block is preserved, including directives this
//! crate does not understand.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::write_atomic;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no server block listening on port {port} for `{name}`")]
    NotFound { port: u16, name: String },

    #[error("{count} server blocks listen on port {port} for `{name}`; refusing to pick one")]
    Ambiguous { port: u16, name: String, count: usize },

    #[error("cannot determine block boundaries at line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },
}

/// The statement that must be present in the target block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Statement words joined by single spaces, as used for detection,
    /// e.g. `include /etc/nginx/snippets/x.conf` or `location /netdata/`.
    pub head: String,
    /// Text inserted when the statement is missing, unindented.
    pub text: String,
}

impl Directive {
    pub fn include(path: &Path) -> Self {
        Self {
            head: format!("include {}", path.display()),
            text: format!("include {};\n", path.display()),
        }
    }

    pub fn block(head: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            text: text.into(),
        }
    }
}

/// Which server block to patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PatchOutcome {
    Inserted { line: usize },
    AlreadyPresent,
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word(String),
    Semi,
    Open,
    Close,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    start: usize,
    end: usize,
}

fn is_delim(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b';' | b'{' | b'}')
}

fn lex(src: &str) -> Result<Vec<Token>, PatchError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            _ if b.is_ascii_whitespace() => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b';' | b'{' | b'}' => {
                let tok = match b {
                    b';' => Tok::Semi,
                    b'{' => Tok::Open,
                    _ => Tok::Close,
                };
                out.push(Token {
                    tok,
                    start: i,
                    end: i + 1,
                });
                i += 1;
            }
            b'"' | b'\'' => {
                let start = i;
                let mut text = Vec::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(malformed(src, start, "unterminated quoted string"));
                        }
                        Some(b'\\') if i + 1 < bytes.len() => {
                            text.push(bytes[i + 1]);
                            i += 2;
                        }
                        Some(&c) if c == b => {
                            i += 1;
                            break;
                        }
                        Some(&c) => {
                            text.push(c);
                            i += 1;
                        }
                    }
                }
                out.push(Token {
                    tok: Tok::Word(String::from_utf8_lossy(&text).into_owned()),
                    start,
                    end: i,
                });
            }
            _ => {
                let start = i;
                while i < bytes.len() && !is_delim(bytes[i]) {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
                        match src[i..].find('}') {
                            Some(off) => {
                                i += off + 1;
                                continue;
                            }
                            None => return Err(malformed(src, i, "unterminated ${variable}")),
                        }
                    }
                    i += 1;
                }
                out.push(Token {
                    tok: Tok::Word(src[start..i].to_owned()),
                    start,
                    end: i,
                });
            }
        }
    }

    Ok(out)
}

// ── Statement tree ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Stmt {
    words: Vec<String>,
    start: usize,
    /// Offset just past the terminating `;` or closing `}`.
    end: usize,
    children: Option<Vec<Stmt>>,
}

impl Stmt {
    fn name(&self) -> &str {
        self.words.first().map(String::as_str).unwrap_or("")
    }

    fn head(&self) -> String {
        self.words.join(" ")
    }
}

fn parse(src: &str, tokens: &[Token]) -> Result<Vec<Stmt>, PatchError> {
    let mut pos = 0;
    let stmts = parse_block(src, tokens, &mut pos, None)?;
    Ok(stmts)
}

/// Parse statements until the closing brace (when `open` is the offset of the
/// opening one) or end of input at top level.
fn parse_block(
    src: &str,
    tokens: &[Token],
    pos: &mut usize,
    open: Option<usize>,
) -> Result<Vec<Stmt>, PatchError> {
    let mut stmts = Vec::new();

    loop {
        let Some(tok) = tokens.get(*pos) else {
            return match open {
                Some(at) => Err(malformed(src, at, "unclosed '{'")),
                None => Ok(stmts),
            };
        };

        match &tok.tok {
            Tok::Close => {
                return match open {
                    Some(_) => Ok(stmts),
                    None => Err(malformed(src, tok.start, "unexpected '}'")),
                };
            }
            Tok::Semi => return Err(malformed(src, tok.start, "unexpected ';'")),
            Tok::Open => return Err(malformed(src, tok.start, "block without a name")),
            Tok::Word(_) => {}
        }

        let start = tok.start;
        let mut words = Vec::new();
        loop {
            let Some(tok) = tokens.get(*pos) else {
                return Err(malformed(src, start, "statement is missing ';'"));
            };
            *pos += 1;
            match &tok.tok {
                Tok::Word(w) => words.push(w.clone()),
                Tok::Semi => {
                    stmts.push(Stmt {
                        words,
                        start,
                        end: tok.end,
                        children: None,
                    });
                    break;
                }
                Tok::Open => {
                    let children = parse_block(src, tokens, pos, Some(tok.start))?;
                    // parse_block stops on the matching '}'.
                    let close = &tokens[*pos];
                    *pos += 1;
                    stmts.push(Stmt {
                        words,
                        start,
                        end: close.end,
                        children: Some(children),
                    });
                    break;
                }
                Tok::Close => return Err(malformed(src, tok.start, "statement is missing ';'")),
            }
        }
    }
}

fn malformed(src: &str, offset: usize, reason: &'static str) -> PatchError {
    PatchError::Malformed {
        line: line_of(src, offset),
        reason,
    }
}

fn line_of(src: &str, offset: usize) -> usize {
    src.as_bytes()[..offset.min(src.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

// ── Matching ──────────────────────────────────────────────────────────────────

fn listen_port(arg: &str) -> Option<u16> {
    if arg.starts_with("unix:") {
        return None;
    }
    let port = match arg.rsplit_once(']') {
        Some((_, rest)) => rest.strip_prefix(':')?,
        None => arg.rsplit_once(':').map_or(arg, |(_, p)| p),
    };
    port.parse().ok()
}

fn server_matches(block: &[Stmt], target: &Target) -> bool {
    let listens = block
        .iter()
        .filter(|s| s.name() == "listen" && s.children.is_none())
        .any(|s| s.words.get(1).and_then(|a| listen_port(a)) == Some(target.port));
    let named = block
        .iter()
        .filter(|s| s.name() == "server_name" && s.children.is_none())
        .flat_map(|s| s.words.iter().skip(1))
        .any(|n| n.eq_ignore_ascii_case(&target.name));
    listens && named
}

/// Collect `server { }` blocks at any depth, without descending into them.
fn server_blocks<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a Stmt>) {
    for s in stmts {
        match &s.children {
            Some(_) if s.name() == "server" && s.words.len() == 1 => out.push(s),
            Some(children) => server_blocks(children, out),
            None => {}
        }
    }
}

// ── Patch ─────────────────────────────────────────────────────────────────────

/// Return the patched text, or `None` when `directive` is already present in
/// the target block.
pub fn patch_text(
    src: &str,
    target: &Target,
    directive: &Directive,
) -> Result<Option<(String, usize)>, PatchError> {
    let tokens = lex(src)?;
    let tree = parse(src, &tokens)?;

    let mut servers = Vec::new();
    server_blocks(&tree, &mut servers);

    let matching: Vec<&Stmt> = servers
        .into_iter()
        .filter(|s| {
            s.children
                .as_deref()
                .is_some_and(|c| server_matches(c, target))
        })
        .collect();

    let block = match matching.as_slice() {
        [] => {
            return Err(PatchError::NotFound {
                port: target.port,
                name: target.name.clone(),
            })
        }
        [one] => *one,
        many => {
            return Err(PatchError::Ambiguous {
                port: target.port,
                name: target.name.clone(),
                count: many.len(),
            })
        }
    };

    let children = block.children.as_deref().unwrap_or_default();
    if children.iter().any(|s| s.head() == directive.head) {
        return Ok(None);
    }

    // server_matches guarantees a server_name statement exists.
    let Some(name_stmt) = children.iter().find(|s| s.name() == "server_name") else {
        return Err(PatchError::NotFound {
            port: target.port,
            name: target.name.clone(),
        });
    };

    let line_start = src[..name_stmt.start].rfind('\n').map_or(0, |i| i + 1);
    let indent: String = src[line_start..name_stmt.start]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect();
    let body = indent_lines(&directive.text, &indent);

    let after = name_stmt.end;
    let line_end = src[after..].find('\n').map(|i| after + i);
    let rest = &src[after..line_end.unwrap_or(src.len())];
    let rest_is_trivia = rest.trim().is_empty() || rest.trim_start().starts_with('#');

    let mut out = String::with_capacity(src.len() + body.len() + indent.len() + 2);
    let inserted_line;
    match (rest_is_trivia, line_end) {
        (true, Some(nl)) => {
            out.push_str(&src[..=nl]);
            inserted_line = line_of(src, nl) + 1;
            out.push_str(&body);
            out.push_str(&src[nl + 1..]);
        }
        (true, None) => {
            out.push_str(src);
            out.push('\n');
            inserted_line = line_of(src, src.len()) + 1;
            out.push_str(&body);
        }
        (false, _) => {
            // Other statements share the server_name line; break the line.
            out.push_str(&src[..after]);
            out.push('\n');
            inserted_line = line_of(src, after) + 1;
            out.push_str(&body);
            out.push_str(&indent);
            out.push_str(src[after..].trim_start_matches(&[' ', '\t'][..]));
        }
    }

    Ok(Some((out, inserted_line)))
}

fn indent_lines(text: &str, pad: &str) -> String {
    text.lines()
        .map(|l| {
            if l.trim().is_empty() {
                "\n".to_owned()
            } else {
                format!("{pad}{l}\n")
            }
        })
        .collect()
}

/// Applies a [`Directive`] to the secured server block of a site file.
pub struct Patcher {
    pub target: Target,
    pub directive: Directive,
}

impl Patcher {
    pub fn new(target: Target, directive: Directive) -> Self {
        Self { target, directive }
    }

    /// Rescan `path` and insert the directive if missing. The file is only
    /// written when its content changes.
    pub fn apply(&self, path: &Path) -> Result<PatchOutcome, PatchError> {
        let src = std::fs::read_to_string(path).map_err(|source| PatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match patch_text(&src, &self.target, &self.directive)? {
            None => {
                debug!(path = %path.display(), head = %self.directive.head, "directive already present");
                Ok(PatchOutcome::AlreadyPresent)
            }
            Some((patched, line)) => {
                write_atomic(path, patched.as_bytes(), None).map_err(|source| {
                    PatchError::Write {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                info!(
                    path = %path.display(),
                    line,
                    port = self.target.port,
                    name = %self.target.name,
                    "injected missing directive"
                );
                Ok(PatchOutcome::Inserted { line })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNIPPET: &str = "/etc/nginx/snippets/gatewright-netdata.conf";

    fn target() -> Target {
        Target {
            port: 443,
            name: "example.com".into(),
        }
    }

    fn include() -> Directive {
        Directive::include(Path::new(SNIPPET))
    }

    const CERTBOT_FILE: &str = "\
# Managed by gatewright for example.com.

server {
    listen 80;
    listen [::]:80;
    server_name example.com www.example.com;
    include /etc/nginx/snippets/gatewright-netdata.conf;

    location / {
        proxy_pass http://127.0.0.1:6969;
    }
}

server {
    server_name example.com www.example.com; # managed by Certbot

    location / {
        proxy_pass http://127.0.0.1:6969;
        proxy_set_header Host $host;
    }

    listen [::]:443 ssl ipv6only=on; # managed by Certbot
    listen 443 ssl; # managed by Certbot
    ssl_certificate /etc/letsencrypt/live/example.com/fullchain.pem; # managed by Certbot
    include /etc/letsencrypt/options-ssl-nginx.conf; # managed by Certbot
}

server {
    listen 443 ssl;
    server_name other.com;
    location /x { return 200 \"{ not a brace }\"; }
}
";

    #[test]
    fn inserts_after_server_name_line_of_target_block() {
        let (out, line) = patch_text(CERTBOT_FILE, &target(), &include()).unwrap().unwrap();
        let expected = CERTBOT_FILE.replacen(
            "server_name example.com www.example.com; # managed by Certbot\n",
            "server_name example.com www.example.com; # managed by Certbot\n    \
             include /etc/nginx/snippets/gatewright-netdata.conf;\n",
            1,
        );
        assert_eq!(out, expected);
        assert_eq!(line, 16);
    }

    #[test]
    fn other_blocks_are_byte_identical() {
        let (out, _) = patch_text(CERTBOT_FILE, &target(), &include()).unwrap().unwrap();
        let other = CERTBOT_FILE.find("server {\n    listen 443 ssl;\n    server_name other.com").unwrap();
        assert!(out.ends_with(&CERTBOT_FILE[other..]));
        let first_end = CERTBOT_FILE.find("}\n\nserver {\n    server_name").unwrap();
        assert_eq!(&out[..first_end], &CERTBOT_FILE[..first_end]);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let (once, _) = patch_text(CERTBOT_FILE, &target(), &include()).unwrap().unwrap();
        assert!(patch_text(&once, &target(), &include()).unwrap().is_none());
    }

    #[test]
    fn plain_listener_block_is_not_a_target() {
        let src = "server {\n    listen 80;\n    server_name example.com;\n}\n";
        let err = patch_text(src, &target(), &include()).unwrap_err();
        assert!(matches!(err, PatchError::NotFound { port: 443, .. }), "{err}");
    }

    #[test]
    fn name_mismatch_is_not_found() {
        let src = "server {\n    listen 443 ssl;\n    server_name example.org;\n}\n";
        assert!(matches!(
            patch_text(src, &target(), &include()),
            Err(PatchError::NotFound { .. })
        ));
    }

    #[test]
    fn unbalanced_braces_are_refused() {
        let src = "server {\n    listen 443 ssl;\n    server_name example.com;\n    location / {\n}\n";
        let err = patch_text(src, &target(), &include()).unwrap_err();
        assert!(matches!(err, PatchError::Malformed { line: 1, .. }), "{err}");

        let src = "server {\n    listen 443;\n    server_name example.com;\n}\n}\n";
        let err = patch_text(src, &target(), &include()).unwrap_err();
        assert!(matches!(err, PatchError::Malformed { line: 5, .. }), "{err}");
    }

    #[test]
    fn duplicate_targets_are_ambiguous() {
        let block = "server {\n    listen 443 ssl;\n    server_name example.com;\n}\n";
        let src = format!("{block}{block}");
        assert!(matches!(
            patch_text(&src, &target(), &include()),
            Err(PatchError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn braces_in_quotes_comments_and_variables_are_ignored() {
        let src = "\
server {
    listen 443 ssl;
    # a stray { in a comment
    server_name example.com;
    add_header X-Test \"}\";
    set $v \"${host}x\";
    return 200 ${request_uri};
}
";
        let (out, _) = patch_text(src, &target(), &include()).unwrap().unwrap();
        assert!(out.contains("    server_name example.com;\n    include "));
    }

    #[test]
    fn server_name_sharing_a_line_is_split() {
        let src = "server { listen 443 ssl; server_name example.com; location / { } }\n";
        let (out, _) = patch_text(src, &target(), &include()).unwrap().unwrap();
        assert_eq!(
            out,
            "server { listen 443 ssl; server_name example.com;\n\
             include /etc/nginx/snippets/gatewright-netdata.conf;\n\
             location / { } }\n"
        );
        assert!(patch_text(&out, &target(), &include()).unwrap().is_none());
    }

    #[test]
    fn block_directive_is_detected_by_location_head() {
        let d = Directive::block(
            "location /netdata/",
            "location /netdata/ {\n    proxy_pass http://127.0.0.1:19999/;\n}\n",
        );
        let src = "server {\n    listen 443 ssl;\n    server_name example.com;\n}\n";
        let (out, _) = patch_text(src, &target(), &d).unwrap().unwrap();
        assert!(out.contains(
            "    server_name example.com;\n    location /netdata/ {\n        proxy_pass http://127.0.0.1:19999/;\n    }\n}"
        ));
        assert!(patch_text(&out, &target(), &d).unwrap().is_none());
    }

    #[test]
    fn listen_port_forms() {
        assert_eq!(listen_port("443"), Some(443));
        assert_eq!(listen_port("0.0.0.0:443"), Some(443));
        assert_eq!(listen_port("[::]:443"), Some(443));
        assert_eq!(listen_port("unix:/run/nginx.sock"), None);
        assert_eq!(listen_port("[::]"), None);
    }

    #[test]
    fn apply_writes_once_then_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com");
        std::fs::write(&path, CERTBOT_FILE).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        let patcher = Patcher::new(target(), include());

        assert!(matches!(
            patcher.apply(&path).unwrap(),
            PatchOutcome::Inserted { line: 16 }
        ));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let first = std::fs::read_to_string(&path).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(patcher.apply(&path).unwrap(), PatchOutcome::AlreadyPresent);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn apply_leaves_malformed_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.com");
        let src = "server {\n    listen 443 ssl;\n    server_name example.com;\n";
        std::fs::write(&path, src).unwrap();
        assert!(Patcher::new(target(), include()).apply(&path).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), src);
    }
}
