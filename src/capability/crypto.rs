//! `crypto` module: encodings, digests and block ciphers.
//!
//! Digests are returned as lowercase hex. AES and DES take
//! `(data, key, iv, mode, padding)` with `ECB` or `CBC` modes and `PKCS`,
//! `ZEROS` or `NO` padding; an empty padding means `PKCS`. Ciphertext is
//! base64 on both sides. RSA is not provided and answers `Unsupported`.

use aes::cipher::block_padding::{NoPadding, Pkcs7, ZeroPadding};
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyInit, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use des::Des;
use md5::Md5;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use super::{optional_arg, string_arg, unsupported, CapabilityError, CRYPTO};

pub(super) const FUNCTIONS: &[&str] = &[
    "base64Encode",
    "base64Decode",
    "urlEncode",
    "urlDecode",
    "hexEncode",
    "hexDecode",
    "md5",
    "sha1",
    "sha256",
    "sha512",
    "aesEncrypt",
    "aesDecrypt",
    "desEncrypt",
    "desDecrypt",
];

pub(super) fn call(function: &str, args: &[Value]) -> Result<Value, CapabilityError> {
    let text = match function {
        "base64Encode" => STANDARD.encode(string_arg("base64Encode", args, 0)?),
        "base64Decode" => {
            let decoded = STANDARD
                .decode(string_arg("base64Decode", args, 0)?)
                .map_err(|e| invalid("base64Decode", &e))?;
            String::from_utf8_lossy(&decoded).into_owned()
        }
        "urlEncode" => urlencoding::encode(string_arg("urlEncode", args, 0)?).into_owned(),
        "urlDecode" => urlencoding::decode(string_arg("urlDecode", args, 0)?)
            .map_err(|e| invalid("urlDecode", &e))?
            .into_owned(),
        "hexEncode" => hex::encode(string_arg("hexEncode", args, 0)?),
        "hexDecode" => {
            let decoded = hex::decode(string_arg("hexDecode", args, 0)?).map_err(|e| invalid("hexDecode", &e))?;
            String::from_utf8_lossy(&decoded).into_owned()
        }
        "md5" => hex::encode(Md5::digest(string_arg("md5", args, 0)?)),
        "sha1" => hex::encode(Sha1::digest(string_arg("sha1", args, 0)?)),
        "sha256" => hex::encode(Sha256::digest(string_arg("sha256", args, 0)?)),
        "sha512" => hex::encode(Sha512::digest(string_arg("sha512", args, 0)?)),
        "aesEncrypt" => encrypt("aesEncrypt", Algorithm::Aes, args)?,
        "aesDecrypt" => decrypt("aesDecrypt", Algorithm::Aes, args)?,
        "desEncrypt" => encrypt("desEncrypt", Algorithm::Des, args)?,
        "desDecrypt" => decrypt("desDecrypt", Algorithm::Des, args)?,
        _ => return Err(unsupported(CRYPTO, function)),
    };
    Ok(Value::String(text))
}

#[derive(Debug, Clone, Copy)]
enum Algorithm {
    Aes,
    Des,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Ecb,
    Cbc,
}

#[derive(Debug, Clone, Copy)]
enum Padding {
    Pkcs,
    Zeros,
    None,
}

/// Arguments shared by every cipher call.
struct CipherArgs<'a> {
    data: &'a str,
    key: &'a [u8],
    iv: &'a [u8],
    mode: Mode,
    padding: Padding,
}

impl<'a> CipherArgs<'a> {
    fn parse(function: &'static str, args: &'a [Value]) -> Result<Self, CapabilityError> {
        let data = string_arg(function, args, 0)?;
        let key = string_arg(function, args, 1)?.as_bytes();
        let iv = text_or_empty(function, args, 2)?.as_bytes();

        let mode = match string_arg(function, args, 3)?.to_ascii_uppercase().as_str() {
            "ECB" => Mode::Ecb,
            "CBC" => Mode::Cbc,
            other => return Err(invalid(function, &format!("mode {other:?} is not supported"))),
        };
        let padding = match text_or_empty(function, args, 4)?.to_ascii_uppercase().as_str() {
            "" | "PKCS" | "PKCS5" | "PKCS7" => Padding::Pkcs,
            "ZEROS" => Padding::Zeros,
            "NO" => Padding::None,
            other => return Err(invalid(function, &format!("padding {other:?} is not supported"))),
        };

        Ok(Self {
            data,
            key,
            iv,
            mode,
            padding,
        })
    }
}

fn encrypt(function: &'static str, algorithm: Algorithm, args: &[Value]) -> Result<String, CapabilityError> {
    let args = CipherArgs::parse(function, args)?;
    let plain = args.data.as_bytes();
    let sealed = match algorithm {
        Algorithm::Des => seal::<Des>(function, &args, plain)?,
        Algorithm::Aes => match args.key.len() {
            16 => seal::<Aes128>(function, &args, plain)?,
            24 => seal::<Aes192>(function, &args, plain)?,
            32 => seal::<Aes256>(function, &args, plain)?,
            n => return Err(invalid(function, &format!("key must be 16, 24 or 32 bytes, got {n}"))),
        },
    };
    Ok(STANDARD.encode(sealed))
}

fn decrypt(function: &'static str, algorithm: Algorithm, args: &[Value]) -> Result<String, CapabilityError> {
    let args = CipherArgs::parse(function, args)?;
    let sealed = STANDARD.decode(args.data).map_err(|e| invalid(function, &e))?;
    let plain = match algorithm {
        Algorithm::Des => open::<Des>(function, &args, &sealed)?,
        Algorithm::Aes => match args.key.len() {
            16 => open::<Aes128>(function, &args, &sealed)?,
            24 => open::<Aes192>(function, &args, &sealed)?,
            32 => open::<Aes256>(function, &args, &sealed)?,
            n => return Err(invalid(function, &format!("key must be 16, 24 or 32 bytes, got {n}"))),
        },
    };
    Ok(String::from_utf8_lossy(&plain).into_owned())
}

fn seal<C>(function: &'static str, args: &CipherArgs<'_>, plain: &[u8]) -> Result<Vec<u8>, CapabilityError>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    match args.mode {
        Mode::Ecb => {
            let encryptor = ecb::Encryptor::<C>::new_from_slice(args.key).map_err(|e| invalid(function, &e))?;
            pad_and_encrypt(function, encryptor, args.padding, plain)
        }
        Mode::Cbc => {
            let encryptor =
                cbc::Encryptor::<C>::new_from_slices(args.key, args.iv).map_err(|e| invalid(function, &e))?;
            pad_and_encrypt(function, encryptor, args.padding, plain)
        }
    }
}

fn open<C>(function: &'static str, args: &CipherArgs<'_>, sealed: &[u8]) -> Result<Vec<u8>, CapabilityError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let plain = match args.mode {
        Mode::Ecb => {
            let decryptor = ecb::Decryptor::<C>::new_from_slice(args.key).map_err(|e| invalid(function, &e))?;
            decrypt_and_unpad(decryptor, args.padding, sealed)
        }
        Mode::Cbc => {
            let decryptor =
                cbc::Decryptor::<C>::new_from_slices(args.key, args.iv).map_err(|e| invalid(function, &e))?;
            decrypt_and_unpad(decryptor, args.padding, sealed)
        }
    };
    plain.map_err(|_| invalid(function, &"ciphertext does not match the key, mode or padding"))
}

fn pad_and_encrypt<E: BlockEncryptMut>(
    function: &'static str,
    encryptor: E,
    padding: Padding,
    plain: &[u8],
) -> Result<Vec<u8>, CapabilityError> {
    Ok(match padding {
        Padding::Pkcs => encryptor.encrypt_padded_vec_mut::<Pkcs7>(plain),
        Padding::Zeros => encryptor.encrypt_padded_vec_mut::<ZeroPadding>(plain),
        Padding::None => {
            if plain.len() % E::block_size() != 0 {
                return Err(invalid(
                    function,
                    &format!("data must be a multiple of {} bytes without padding", E::block_size()),
                ));
            }
            encryptor.encrypt_padded_vec_mut::<NoPadding>(plain)
        }
    })
}

fn decrypt_and_unpad<D: BlockDecryptMut>(
    decryptor: D,
    padding: Padding,
    sealed: &[u8],
) -> Result<Vec<u8>, aes::cipher::block_padding::UnpadError> {
    match padding {
        Padding::Pkcs => decryptor.decrypt_padded_vec_mut::<Pkcs7>(sealed),
        Padding::Zeros => decryptor.decrypt_padded_vec_mut::<ZeroPadding>(sealed),
        Padding::None => decryptor.decrypt_padded_vec_mut::<NoPadding>(sealed),
    }
}

/// A missing or `null` argument reads as the empty string.
fn text_or_empty<'a>(function: &'static str, args: &'a [Value], index: usize) -> Result<&'a str, CapabilityError> {
    match optional_arg(args, index) {
        None => Ok(""),
        Some(_) => string_arg(function, args, index),
    }
}

fn invalid(function: &'static str, error: &dyn std::fmt::Display) -> CapabilityError {
    CapabilityError::InvalidArgument {
        function,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(function: &str, input: &str) -> String {
        match call(function, &[json!(input)]).unwrap() {
            Value::String(text) => text,
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            text("sha256", "abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn base64_and_url_encoding_reverse() {
        let encoded = text("base64Encode", "这是一条测试消息");
        assert_eq!(text("base64Decode", &encoded), "这是一条测试消息");

        assert_eq!(text("urlEncode", "a b&c"), "a%20b%26c");
        assert_eq!(text("urlDecode", "a%20b%26c"), "a b&c");
    }

    #[test]
    fn malformed_base64_is_an_argument_error() {
        assert!(matches!(
            call("base64Decode", &[json!("***")]),
            Err(CapabilityError::InvalidArgument { .. })
        ));
    }

    fn cipher(function: &str, args: &[Value]) -> String {
        match call(function, args).unwrap() {
            Value::String(text) => text,
            other => panic!("unexpected {other}"),
        }
    }

    const AES_KEY: &str = "9uFCkzsu3NMtL.jC";
    const AES_IV: &str = "pf7L-yDtb4-KW4Js";

    #[test]
    fn legacy_digests_are_lowercase_hex() {
        assert_eq!(text("md5", "abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(text("sha1", "abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn aes_matches_known_ciphertexts() {
        let cbc = [json!("hello world"), json!(AES_KEY), json!(AES_IV), json!("CBC"), json!("PKCS")];
        assert_eq!(cipher("aesEncrypt", &cbc), "o/0AYrK4DbcvbXuNNsHLWQ==");

        let ecb = [json!("hello world"), json!(AES_KEY), Value::Null, json!("ECB")];
        assert_eq!(cipher("aesEncrypt", &ecb), "EY/wJ7nnMz8qZDJEy9cX3Q==");

        let zeros = [json!("hello world"), json!(AES_KEY), json!(""), json!("ECB"), json!("ZEROS")];
        assert_eq!(cipher("aesEncrypt", &zeros), "dbjVweDLTZEDMe5h+7PJJQ==");
    }

    #[test]
    fn des_matches_known_ciphertexts() {
        let cbc = [json!("hello world"), json!("3NMtL.jC"), json!("b4-KW4Js"), json!("CBC"), json!("")];
        assert_eq!(cipher("desEncrypt", &cbc), "e6hDYZRNu5RMKQc4o+FJZA==");

        let ecb = [json!("hello world"), json!("3NMtL.jC"), json!(""), json!("ECB"), json!("PKCS")];
        assert_eq!(cipher("desEncrypt", &ecb), "Gzjzz1iiimqr0WoadkqJvQ==");
    }

    #[test]
    fn decrypt_recovers_the_plaintext() {
        let args = [json!("o/0AYrK4DbcvbXuNNsHLWQ=="), json!(AES_KEY), json!(AES_IV), json!("cbc")];
        assert_eq!(cipher("aesDecrypt", &args), "hello world");

        let args = [json!("Gzjzz1iiimqr0WoadkqJvQ=="), json!("3NMtL.jC"), Value::Null, json!("ECB")];
        assert_eq!(cipher("desDecrypt", &args), "hello world");
    }

    #[test]
    fn bad_cipher_arguments_are_argument_errors() {
        let short_key = [json!("x"), json!("short"), json!(""), json!("ECB")];
        let unaligned = [json!("hello"), json!(AES_KEY), json!(""), json!("ECB"), json!("NO")];
        let stream_mode = [json!("x"), json!(AES_KEY), json!(AES_IV), json!("CFB")];
        let short_iv = [json!("x"), json!(AES_KEY), json!("iv"), json!("CBC")];
        let wrong_key = [json!("o/0AYrK4DbcvbXuNNsHLWQ=="), json!("0123456789abcdef"), json!(AES_IV), json!("CBC")];

        for args in [&short_key[..], &unaligned[..], &stream_mode[..], &short_iv[..]] {
            assert!(matches!(
                call("aesEncrypt", args),
                Err(CapabilityError::InvalidArgument { .. })
            ));
        }
        assert!(matches!(
            call("aesDecrypt", &wrong_key),
            Err(CapabilityError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn rsa_is_not_provided() {
        assert!(matches!(
            call("rsaEncrypt", &[json!("data")]),
            Err(CapabilityError::Unsupported { .. })
        ));
    }
}
