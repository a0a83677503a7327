// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of redgreen.
//
// redgreen is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// redgreen is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with redgreen.  If not,
// see <http://www.gnu.org/licenses/>.

//! # render
//!
//! HTML for the browser-facing views. Two pages: the home page (an upload form plus the curl
//! one-liner) and the diff view, unified or split. The markup is assembled in code; it's a
//! couple of screens of HTML & a template engine would be more machinery than page.

use url::form_urlencoded;

use crate::diff::{Hunk, LineKind, Unified};

/// Everything the diff page needs to render itself
pub struct DiffPage<'a> {
    pub id: &'a str,
    pub diff: &'a Unified,
    /// Whitespace mode: "", "w" or "b"
    pub space: &'a str,
    pub context: usize,
    pub split: bool,
    /// The request's query string, decoded; preserved when any one knob is toggled
    pub query: &'a [(String, String)],
}

/// Minimal HTML escaping (text & attribute contexts)
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Re-encode `query` with `key` set to `value` (removed, when `value` is empty), leading '?'
/// included; an emptied query renders as ""
pub fn with_query_value(query: &[(String, String)], key: &str, value: &str) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| k != key)
        .cloned()
        .collect();
    if !value.is_empty() {
        pairs.push((key.to_owned(), value.to_owned()));
    }
    if pairs.is_empty() {
        return String::new();
    }
    pairs.sort();
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (k, v) in &pairs {
        serializer.append_pair(k, v);
    }
    format!("?{}", serializer.finish())
}

/// The conventional hunk header: the count is omitted when it's exactly one (but *not* when
/// it's zero, where "-l,0" marks a pure insertion point)
pub fn hunk_header(hunk: &Hunk) -> String {
    let mut out = String::from("@@");
    if hunk.count_old == 1 {
        out.push_str(&format!(" -{}", hunk.line_old));
    } else {
        out.push_str(&format!(" -{},{}", hunk.line_old, hunk.count_old));
    }
    if hunk.count_new == 1 {
        out.push_str(&format!(" +{}", hunk.line_new));
    } else {
        out.push_str(&format!(" +{},{}", hunk.line_new, hunk.count_new));
    }
    out.push_str(" @@");
    out
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           home page                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub fn index_page(public_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>redgreen</title>
<link rel="stylesheet" href="/static/redgreen.css">
</head>
<body>
<header><h1>redgreen</h1><p>paste two files, get a diff you can link to</p></header>
<main>
<form action="/" method="post" enctype="multipart/form-data">
<label>red (old) <input type="file" name="red" required></label>
<label>green (new) <input type="file" name="green" required></label>
<input type="submit" value="diff">
</form>
<p>or, from a shell:</p>
<pre>usage: curl -F red=@before.txt -F green=@after.txt {}</pre>
</main>
</body>
</html>
"#,
        escape(public_url)
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           diff page                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn line_class(kind: LineKind) -> &'static str {
    match kind {
        LineKind::Insert => "ins",
        LineKind::Delete => "del",
        LineKind::Equal => "ctx",
    }
}

fn num(n: Option<usize>) -> String {
    n.map(|n| n.to_string()).unwrap_or_default()
}

fn unified_hunk(hunk: &Hunk) -> String {
    let mut out = String::from("<table class=\"diff\">\n");
    for line in &hunk.lines {
        out.push_str(&format!(
            "<tr class=\"{}\"><td class=\"num\">{}</td><td class=\"num\">{}</td><td class=\"line\">{}</td></tr>\n",
            line_class(line.kind()),
            num(line.number_x),
            num(line.number_y),
            escape(&line.value),
        ));
    }
    out.push_str("</table>\n");
    out
}

fn split_column(hunk: &Hunk, old_side: bool) -> String {
    let paddings = hunk.split_view_paddings();
    let pads = if old_side {
        &paddings.red
    } else {
        &paddings.green
    };
    let mut out = String::from("<table class=\"diff\">\n");
    for (i, line) in hunk.lines.iter().enumerate() {
        let visible = match line.kind() {
            LineKind::Equal => true,
            LineKind::Delete => old_side,
            LineKind::Insert => !old_side,
        };
        if visible {
            let number = if old_side {
                line.number_x
            } else {
                line.number_y
            };
            out.push_str(&format!(
                "<tr class=\"{}\"><td class=\"num\">{}</td><td class=\"line\">{}</td></tr>\n",
                line_class(line.kind()),
                num(number),
                escape(&line.value),
            ));
        }
        if let Some(&n) = pads.get(&i) {
            for _ in 0..n {
                out.push_str("<tr class=\"pad\"><td class=\"num\"></td><td class=\"line\">&nbsp;</td></tr>\n");
            }
        }
    }
    out.push_str("</table>\n");
    out
}

/// The `c` links: a seven-value window around the current context, shifted to stay within
/// [0, 1000]; the default (3) encodes as no parameter at all
fn context_links(page: &DiffPage) -> String {
    const MIN_VAL: i64 = 0;
    const MAX_VAL: i64 = 1000;
    let mut smallest = page.context as i64 - 3;
    let mut greatest = page.context as i64 + 3;
    if smallest < MIN_VAL {
        greatest += MIN_VAL - smallest;
        smallest = MIN_VAL;
    }
    if greatest > MAX_VAL {
        smallest -= greatest - MAX_VAL;
        greatest = MAX_VAL;
    }
    let mut out = String::new();
    for i in smallest..=greatest {
        if !out.is_empty() {
            out.push_str(" | ");
        }
        if i == page.context as i64 {
            out.push_str(&format!("<b>{i}</b>"));
            continue;
        }
        let value = if i == 3 { String::new() } else { i.to_string() };
        let uri = format!("/{}{}", page.id, with_query_value(page.query, "c", &value));
        out.push_str(&format!("<a href=\"{}\">{}</a>", escape(&uri), i));
    }
    out
}

fn whitespace_links(page: &DiffPage) -> String {
    [("", "exact"), ("b", "-b"), ("w", "-w")]
        .iter()
        .map(|(mode, label)| {
            if *mode == page.space {
                format!("<b>{label}</b>")
            } else {
                let uri = format!("/{}{}", page.id, with_query_value(page.query, "w", mode));
                format!("<a href=\"{}\">{}</a>", escape(&uri), label)
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn split_toggle(page: &DiffPage) -> String {
    if page.split {
        let uri = format!("/{}{}", page.id, with_query_value(page.query, "split", ""));
        format!("<a href=\"{}\">unified</a> | <b>split</b>", escape(&uri))
    } else {
        let uri = format!("/{}{}", page.id, with_query_value(page.query, "split", "1"));
        format!("<b>unified</b> | <a href=\"{}\">split</a>", escape(&uri))
    }
}

pub fn diff_page(page: &DiffPage) -> String {
    let mut body = String::new();
    if page.diff.is_empty() {
        body.push_str("<p class=\"identical\">files are identical</p>\n");
    } else {
        for hunk in &page.diff.hunks {
            body.push_str(&format!(
                "<div class=\"hunk\">\n<div class=\"hunk-header\">{}</div>\n",
                escape(&hunk_header(hunk))
            ));
            if page.split {
                body.push_str(&format!(
                    "<div class=\"split\">\n<div class=\"col\">{}</div>\n<div class=\"col\">{}</div>\n</div>\n",
                    split_column(hunk, true),
                    split_column(hunk, false),
                ));
            } else {
                body.push_str(&unified_hunk(hunk));
            }
            body.push_str("</div>\n");
        }
    }
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{id} - redgreen</title>
<link rel="stylesheet" href="/static/redgreen.css">
</head>
<body>
<header><h1><a href="/">redgreen</a> / {id}</h1></header>
<nav>
<span>raw: <a href="/{id}.diff">{id}.diff</a> | <a href="/{id}/red">{red}</a> | <a href="/{id}/green">{green}</a></span><br>
<span>whitespace: {ws}</span> &middot; <span>context: {ctx}</span> &middot; <span>{split}</span>
</nav>
<main>
{body}</main>
</body>
</html>
"#,
        id = escape(page.id),
        red = escape(&page.diff.old_name),
        green = escape(&page.diff.new_name),
        ws = whitespace_links(page),
        ctx = context_links(page),
        split = split_toggle(page),
        body = body,
    )
}
