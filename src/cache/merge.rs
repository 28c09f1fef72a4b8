//! Three-way text reconciliation.
//!
//! `merge(base, local, incoming)` re-applies the edit that turned `base` into
//! `local` on top of `incoming`. Texts are split into word, whitespace and
//! punctuation tokens; both sides are aligned against `base` with a longest
//! common subsequence, and the regions between tokens that all three agree on
//! are resolved independently:
//!
//! - only one side changed the region: take that side
//! - both sides made the same change: take it once
//! - both sides changed it differently: keep the incoming text followed by the
//!   local text, so neither edit is lost

/// Upper bound on LCS table cells; larger middles are treated as wholly changed.
const MAX_TABLE_CELLS: usize = 4_000_000;

pub fn merge(base: &str, local: &str, incoming: &str) -> String {
  if local == base || local == incoming {
    return incoming.to_string();
  }
  if incoming == base {
    return local.to_string();
  }

  let o = tokenize(base);
  let a = tokenize(local);
  let b = tokenize(incoming);

  let a_for_o = align(&o, &a);
  let b_for_o = align(&o, &b);

  let mut out = String::with_capacity(local.len().max(incoming.len()));
  let (mut io, mut ia, mut ib) = (0usize, 0usize, 0usize);

  loop {
    // Emit stable tokens matched on all three sides at the current cursor.
    while io < o.len() && a_for_o[io] == Some(ia) && b_for_o[io] == Some(ib) {
      out.push_str(o[io]);
      io += 1;
      ia += 1;
      ib += 1;
    }

    let next_stable = (io..o.len()).find_map(|k| match (a_for_o[k], b_for_o[k]) {
      (Some(x), Some(y)) => Some((k, x, y)),
      _ => None,
    });

    let (k, x, y) = next_stable.unwrap_or((o.len(), a.len(), b.len()));
    resolve(&o[io..k], &a[ia..x], &b[ib..y], &mut out);
    io = k;
    ia = x;
    ib = y;

    if next_stable.is_none() {
      break;
    }
  }

  out
}

fn resolve(o: &[&str], a: &[&str], b: &[&str], out: &mut String) {
  if a == o {
    push_all(out, b);
  } else if b == o || a == b {
    push_all(out, a);
  } else {
    push_all(out, b);
    push_all(out, a);
  }
}

fn push_all(out: &mut String, tokens: &[&str]) {
  for token in tokens {
    out.push_str(token);
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Class {
  Word,
  Space,
  Other,
}

fn class_of(c: char) -> Class {
  if c.is_alphanumeric() || c == '_' {
    Class::Word
  } else if c.is_whitespace() {
    Class::Space
  } else {
    Class::Other
  }
}

/// Split into runs of word characters, runs of whitespace, and single punctuation marks.
fn tokenize(s: &str) -> Vec<&str> {
  let mut tokens = Vec::new();
  let mut start = 0;
  let mut prev: Option<Class> = None;

  for (i, c) in s.char_indices() {
    let class = class_of(c);
    let boundary = match prev {
      None => false,
      Some(p) => p != class || class == Class::Other,
    };
    if boundary {
      tokens.push(&s[start..i]);
      start = i;
    }
    prev = Some(class);
  }
  if start < s.len() {
    tokens.push(&s[start..]);
  }
  tokens
}

/// For each token of `o`, the index of the token in `x` it is matched to, if any.
fn align(o: &[&str], x: &[&str]) -> Vec<Option<usize>> {
  let mut matched = vec![None; o.len()];

  let prefix = o.iter().zip(x.iter()).take_while(|(p, q)| p == q).count();
  for (i, slot) in matched.iter_mut().enumerate().take(prefix) {
    *slot = Some(i);
  }

  let suffix = o[prefix..]
    .iter()
    .rev()
    .zip(x[prefix..].iter().rev())
    .take_while(|(p, q)| p == q)
    .count();
  for i in 0..suffix {
    matched[o.len() - 1 - i] = Some(x.len() - 1 - i);
  }

  let o_mid = &o[prefix..o.len() - suffix];
  let x_mid = &x[prefix..x.len() - suffix];
  for (oi, xi) in lcs_pairs(o_mid, x_mid) {
    matched[prefix + oi] = Some(prefix + xi);
  }

  matched
}

fn lcs_pairs(o: &[&str], x: &[&str]) -> Vec<(usize, usize)> {
  let (n, m) = (o.len(), x.len());
  if n == 0 || m == 0 || (n + 1).saturating_mul(m + 1) > MAX_TABLE_CELLS {
    return Vec::new();
  }

  // table[i][j] = LCS length of o[i..] and x[j..]
  let width = m + 1;
  let mut table = vec![0u32; (n + 1) * width];
  for i in (0..n).rev() {
    for j in (0..m).rev() {
      table[i * width + j] = if o[i] == x[j] {
        table[(i + 1) * width + j + 1] + 1
      } else {
        table[(i + 1) * width + j].max(table[i * width + j + 1])
      };
    }
  }

  let mut pairs = Vec::new();
  let (mut i, mut j) = (0, 0);
  while i < n && j < m {
    if o[i] == x[j] {
      pairs.push((i, j));
      i += 1;
      j += 1;
    } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
      i += 1;
    } else {
      j += 1;
    }
  }
  pairs
}
