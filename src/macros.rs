// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// A fully-specified box must be consumed exactly; leftover content means
/// the parser and the file disagree about the layout.
macro_rules! check_parser_state {
    ( $box:expr ) => {
        if $box.bytes_left() > 0 {
            debug!("bad parser state: {} content bytes left", $box.bytes_left());
            return Err(Error::InvalidData("unread box content or bad parser offset"));
        }
    };
}
