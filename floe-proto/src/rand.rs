// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use rand::prelude::*;

pub(crate) const ICE_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

pub(crate) fn generate_random_ice_string(alphabet: &[u8], length: usize) -> String {
    let mut rng = rand::thread_rng();
    String::from_iter((0..length).map(|_| *alphabet.choose(&mut rng).unwrap() as char))
}

pub(crate) fn rand_u64() -> u64 {
    rand::thread_rng().gen()
}
