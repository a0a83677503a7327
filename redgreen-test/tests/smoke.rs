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

//! # redgreen end-to-end smoke tests
//!
//! Custom harness (`harness = false` + [libtest-mimic]): the single server stood-up by
//! [Helper](redgreen_test::Helper) is a fixture shared by every trial, something the stock
//! harness has no notion of. Each trial drives it over real HTTP with a blocking client.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html

use libtest_mimic::{Arguments, Failed, Trial};
use regex::Regex;
use reqwest::{
    blocking::{multipart, Client},
    header::{CONTENT_DISPOSITION, LOCATION, USER_AGENT},
    redirect, StatusCode,
};

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:124.0) Gecko/20100101 Firefox/124.0";

const RED: &str = "a\nb\nc\nd\n";
const GREEN: &str = "a\nd\ne\n";

/// A client that reports redirects rather than following them (the 302 is the point)
fn client() -> Result<Client, Failed> {
    Ok(Client::builder()
        .redirect(redirect::Policy::none())
        .build()?)
}

fn file_form(red: &str, green: &str) -> multipart::Form {
    multipart::Form::new()
        .part(
            "red",
            multipart::Part::bytes(red.as_bytes().to_vec()).file_name("a.txt"),
        )
        .part(
            "green",
            multipart::Part::bytes(green.as_bytes().to_vec()).file_name("a.txt"),
        )
}

/// POST the two files; return the Location header
fn upload(client: &Client, base: &str, red: &str, green: &str) -> Result<String, Failed> {
    let rsp = client.post(base).multipart(file_form(red, green)).send()?;
    if rsp.status() != StatusCode::FOUND {
        return Err(format!("expected 302, got {}", rsp.status()).into());
    }
    let location = rsp
        .headers()
        .get(LOCATION)
        .ok_or("no Location header")?
        .to_str()
        .map_err(|err| err.to_string())?
        .to_owned();
    // The body carries the link too, newline-terminated, for the curl crowd.
    let body = rsp.text()?;
    if body != format!("{location}\n") {
        return Err(format!("body {body:?} doesn't match Location {location}").into());
    }
    Ok(location)
}

fn usage_for_non_browsers(base: &str) -> Result<(), Failed> {
    let rsp = client()?.get(base).send()?;
    if rsp.status() != StatusCode::OK {
        return Err(format!("expected 200, got {}", rsp.status()).into());
    }
    let body = rsp.text()?;
    if body != format!("usage: curl -F red=@before.txt -F green=@after.txt {base}\n") {
        return Err(format!("unexpected usage string: {body:?}").into());
    }
    // A browser gets the upload form instead.
    let body = client()?.get(base).header(USER_AGENT, FIREFOX).send()?.text()?;
    if !body.contains("<form") {
        return Err("no upload form in the browser home page".into());
    }
    Ok(())
}

fn upload_then_diff(base: &str) -> Result<(), Failed> {
    let client = client()?;
    let location = upload(&client, base, RED, GREEN)?;
    let body = client.get(&location).send()?.text()?;
    if !body.contains(" a\n-b\n-c\n d\n") {
        return Err(format!("diff body missing the expected hunk: {body:?}").into());
    }
    Ok(())
}

fn reuploads_are_idempotent(base: &str) -> Result<(), Failed> {
    let client = client()?;
    let first = upload(&client, base, "same\ncontent\n", "same\ncontent!\n")?;
    let second = upload(&client, base, "same\ncontent\n", "same\ncontent!\n")?;
    if first != second {
        return Err(format!("locations differ: {first} vs {second}").into());
    }
    Ok(())
}

fn form_value_uploads_carry_names(base: &str) -> Result<(), Failed> {
    let client = client()?;
    let form = multipart::Form::new()
        .text("red_name", "redder")
        .text("red", RED)
        .text("green_name", "greener")
        .text("green", GREEN);
    let rsp = client.post(base).multipart(form).send()?;
    if rsp.status() != StatusCode::FOUND {
        return Err(format!("expected 302, got {}", rsp.status()).into());
    }
    let location = rsp
        .headers()
        .get(LOCATION)
        .ok_or("no Location header")?
        .to_str()
        .map_err(|err| err.to_string())?
        .to_owned();

    for (side, name, content) in [("red", "redder", RED), ("green", "greener", GREEN)] {
        let rsp = client.get(format!("{location}/{side}")).send()?;
        let disposition = rsp
            .headers()
            .get(CONTENT_DISPOSITION)
            .ok_or("no Content-Disposition")?
            .to_str()
            .map_err(|err| err.to_string())?
            .to_owned();
        if disposition != format!("inline; filename=\"{name}\"") {
            return Err(format!("unexpected disposition {disposition:?}").into());
        }
        if rsp.text()? != content {
            return Err(format!("{side} content mismatch").into());
        }
    }
    Ok(())
}

fn missing_content_type_is_a_usage_error(base: &str) -> Result<(), Failed> {
    let rsp = client()?.post(base).body("not multipart").send()?;
    if rsp.status() != StatusCode::BAD_REQUEST {
        return Err(format!("expected 400, got {}", rsp.status()).into());
    }
    let body = rsp.text()?;
    if !body.contains("multipart/form-data") {
        return Err(format!("400 body doesn't name multipart/form-data: {body:?}").into());
    }
    Ok(())
}

fn wrong_fields_are_a_usage_error(base: &str) -> Result<(), Failed> {
    let form = multipart::Form::new()
        .text("purple", "a\n")
        .text("green", "b\n")
        .text("orange", "c\n");
    let rsp = client()?.post(base).multipart(form).send()?;
    if rsp.status() != StatusCode::BAD_REQUEST {
        return Err(format!("expected 400, got {}", rsp.status()).into());
    }
    let body = rsp.text()?;
    if !body.contains("usage: curl -F") {
        return Err(format!("400 body doesn't carry the usage string: {body:?}").into());
    }
    Ok(())
}

fn the_101st_upload_is_limited(base: &str) -> Result<(), Failed> {
    let client = client()?;
    // One hundred *distinct* payloads from one forwarded client address all pass...
    for i in 0..100 {
        let form = multipart::Form::new()
            .text("red", format!("payload number {i}\n"))
            .text("green", "and now for something completely different\n");
        let rsp = client
            .post(base)
            .header("X-Forwarded-For", "171.81.83.116")
            .multipart(form)
            .send()?;
        if rsp.status() != StatusCode::FOUND {
            return Err(format!("upload {i}: expected 302, got {}", rsp.status()).into());
        }
    }
    // ...and the one-hundred-first does not.
    let form = multipart::Form::new()
        .text("red", "payload number 100\n")
        .text("green", "and now for something completely different\n");
    let rsp = client
        .post(base)
        .header("X-Forwarded-For", "171.81.83.116")
        .multipart(form)
        .send()?;
    if rsp.status() != StatusCode::TOO_MANY_REQUESTS {
        return Err(format!("expected 429, got {}", rsp.status()).into());
    }
    let body = rsp.text()?;
    let re = Regex::new(
        r"^limit exceeded; will reset on \d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z \(in \d+h\d{2}m\d{2}s\)\n$",
    )
    .unwrap();
    if !re.is_match(&body) {
        return Err(format!("unexpected 429 body: {body:?}").into());
    }
    Ok(())
}

fn unknown_ids_404(base: &str) -> Result<(), Failed> {
    for id in ["zzzzzzzz", "not-an-id", "abc"] {
        let rsp = client()?.get(format!("{base}/{id}")).send()?;
        if rsp.status() != StatusCode::NOT_FOUND {
            return Err(format!("{id}: expected 404, got {}", rsp.status()).into());
        }
        if rsp.text()? != "not found" {
            return Err(format!("{id}: unexpected 404 body").into());
        }
    }
    Ok(())
}

fn diff_suffix_forces_text(base: &str) -> Result<(), Failed> {
    let client = client()?;
    let location = upload(&client, base, RED, GREEN)?;
    // Browser UA, but the .diff suffix wins.
    let rsp = client
        .get(format!("{location}.diff"))
        .header(USER_AGENT, FIREFOX)
        .send()?;
    let body = rsp.text()?;
    if !body.starts_with("diff a.txt a.txt\n--- a.txt\n+++ a.txt\n@@ ") {
        return Err(format!("unexpected raw diff: {body:?}").into());
    }
    // Without the suffix, the same UA gets HTML.
    let body = client
        .get(&location)
        .header(USER_AGENT, FIREFOX)
        .send()?
        .text()?;
    if !body.contains("<table class=\"diff\"") {
        return Err("no diff table in the HTML view".into());
    }
    // And ?split switches the rendering.
    let body = client
        .get(format!("{location}?split"))
        .header(USER_AGENT, FIREFOX)
        .send()?
        .text()?;
    if !body.contains("class=\"split\"") {
        return Err("no split view".into());
    }
    Ok(())
}

fn the_example_diff_needs_no_upload(base: &str) -> Result<(), Failed> {
    let client = client()?;
    // Nothing has been uploaded under "example"; the demo pair is baked in.
    let body = client.get(format!("{base}/example")).send()?.text()?;
    if !body.starts_with("diff main.rs server.rs\n--- main.rs\n+++ server.rs\n@@ ") {
        return Err(format!("unexpected example diff: {body:?}").into());
    }
    // The component files are served through the same path as real uploads...
    let rsp = client.get(format!("{base}/example/red")).send()?;
    let disposition = rsp
        .headers()
        .get(CONTENT_DISPOSITION)
        .ok_or("no Content-Disposition")?
        .to_str()
        .map_err(|err| err.to_string())?
        .to_owned();
    if disposition != "inline; filename=\"main.rs\"" {
        return Err(format!("unexpected disposition {disposition:?}").into());
    }
    if !rsp.text()?.contains("say_hello") {
        return Err("example red file missing its content".into());
    }
    // ...as is the HTML rendering.
    let body = client
        .get(format!("{base}/example"))
        .header(USER_AGENT, FIREFOX)
        .send()?
        .text()?;
    if !body.contains("<table class=\"diff\"") {
        return Err("no diff table in the example HTML view".into());
    }
    Ok(())
}

fn whitespace_modes_apply(base: &str) -> Result<(), Failed> {
    let client = client()?;
    let location = upload(&client, base, "a  b\nunchanged\n", "a b\nunchanged\n")?;
    // Exact comparison sees the squeezed run...
    let body = client.get(&location).send()?.text()?;
    if !body.contains("-a  b\n") || !body.contains("+a b\n") {
        return Err(format!("expected a whitespace-only change: {body:?}").into());
    }
    // ...which -b waves through (empty diff, empty body).
    let body = client.get(format!("{location}?w=b")).send()?.text()?;
    if !body.is_empty() {
        return Err(format!("expected an empty diff under w=b: {body:?}").into());
    }
    Ok(())
}

fn main() {
    let args = Arguments::from_args();
    let helper = redgreen_test::Helper::start().expect("failed to start the redgreen server");
    let base = helper.base_url.clone();

    fn trial(
        name: &'static str,
        base: &str,
        f: fn(&str) -> Result<(), Failed>,
    ) -> Trial {
        let base = base.to_owned();
        Trial::test(name, move || f(&base))
    }

    let trials = vec![
        trial("usage_for_non_browsers", &base, usage_for_non_browsers),
        trial("upload_then_diff", &base, upload_then_diff),
        trial("reuploads_are_idempotent", &base, reuploads_are_idempotent),
        trial(
            "form_value_uploads_carry_names",
            &base,
            form_value_uploads_carry_names,
        ),
        trial(
            "missing_content_type_is_a_usage_error",
            &base,
            missing_content_type_is_a_usage_error,
        ),
        trial(
            "wrong_fields_are_a_usage_error",
            &base,
            wrong_fields_are_a_usage_error,
        ),
        trial("the_101st_upload_is_limited", &base, the_101st_upload_is_limited),
        trial("unknown_ids_404", &base, unknown_ids_404),
        trial("diff_suffix_forces_text", &base, diff_suffix_forces_text),
        trial(
            "the_example_diff_needs_no_upload",
            &base,
            the_example_diff_needs_no_upload,
        ),
        trial("whitespace_modes_apply", &base, whitespace_modes_apply),
    ];

    libtest_mimic::run(&args, trials).exit();
}
