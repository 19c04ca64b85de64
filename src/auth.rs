use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::conf::ConfJwt;

pub type Result<T> = jsonwebtoken::errors::Result<T>;

/// Bearer token claims. `sub` is the user identity the quota is keyed on.
#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
pub struct Claims {
    pub sub: String,
    aud: String,
    iss: String,
    exp: u64,
}

impl Claims {
    pub fn new(
        sub: &str,
        ttl: Duration,
        jwt_conf: &ConfJwt,
    ) -> anyhow::Result<Self> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let exp = now.saturating_add(ttl).as_secs();
        Ok(Self {
            sub: sub.to_string(),
            aud: jwt_conf.audience.clone(),
            iss: jwt_conf.issuer.clone(),
            exp,
        })
    }

    pub fn to_str(&self, jwt_conf: &ConfJwt) -> Result<String> {
        let key = EncodingKey::from_secret(jwt_conf.secret.as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), self, &key)
    }

    pub fn from_str(str: &str, jwt_conf: &ConfJwt) -> Result<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0; // "exp" should mean what it says.
        validation.set_audience(&[&jwt_conf.audience]);
        validation.set_issuer(&[&jwt_conf.issuer]);
        let key = DecodingKey::from_secret(jwt_conf.secret.as_bytes());
        let jsonwebtoken::TokenData { claims, .. } =
            jsonwebtoken::decode::<Self>(str, &key, &validation)?;
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use jsonwebtoken::errors::ErrorKind;

    use crate::conf::ConfJwt;

    use super::Claims;

    #[test]
    fn good() {
        let conf = ConfJwt::default();
        let claims =
            Claims::new("ada@example.com", Duration::from_secs(5), &conf)
                .unwrap();
        let encoded: String = claims.to_str(&conf).unwrap();
        let decoded = Claims::from_str(&encoded, &conf).unwrap();
        assert_eq!(&claims, &decoded);
        assert_eq!(decoded.sub, "ada@example.com");
    }

    #[test]
    fn bad_key() {
        let conf_good = ConfJwt::default();
        let conf_bad = ConfJwt {
            secret: conf_good.secret.to_string() + "naughty",
            ..conf_good.clone()
        };
        let claims =
            Claims::new("foo", Duration::from_secs(5), &conf_good).unwrap();

        let encoded: String = claims.to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_bad);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_audience() {
        let conf_good = ConfJwt::default();
        let conf_other = ConfJwt {
            audience: "somebody-else".to_string(),
            ..conf_good.clone()
        };
        let claims =
            Claims::new("foo", Duration::from_secs(5), &conf_other).unwrap();

        let encoded: String = claims.to_str(&conf_good).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf_good);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::InvalidAudience)
        ));
    }

    #[test]
    fn expired() {
        let conf = ConfJwt {
            secret: "super secret".to_string(),
            ..Default::default()
        };

        let mut claims = Claims::new("foo", Duration::ZERO, &conf).unwrap();
        claims.exp -= 10; // Expire arbitrarily-far back in the past.

        let encoded: String = claims.to_str(&conf).unwrap();
        let decode_result = Claims::from_str(&encoded, &conf);

        assert!(matches!(
            decode_result,
            Err(e) if e.kind().eq(&ErrorKind::ExpiredSignature)
        ));
    }
}
