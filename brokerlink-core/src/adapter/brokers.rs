//! Login page profiles for the supported brokers.

use brokerlink_model::{BrokerIdentity, ChallengeKind};

use super::profile::{BrokerProfile, TwoFactorProfile};

const GENERIC_CODE_INPUTS: &[&str] = &[
    "input[autocomplete=\"one-time-code\"]",
    "input[name=\"otp\"]",
    "input[type=\"tel\"]",
];

const GENERIC_CODE_SUBMITS: &[&str] = &["button[type=\"submit\"]", "input[type=\"submit\"]"];

const GENERIC_CODE_REJECTIONS: &[&str] = &[
    "code you entered is incorrect",
    "code is invalid",
    "code has expired",
];

/// Merrill Edge: plain login form, SMS code challenge.
pub fn merrill_edge_profile() -> BrokerProfile {
    BrokerProfile {
        broker: BrokerIdentity::MerrillEdge,
        login_url: "https://olui2.fs.ml.com/login/signin.aspx",
        portfolio_url: "https://olui2.fs.ml.com/TFPHoldings/HoldingsByAccount.aspx",
        login_frame: None,
        username_selectors: &[
            "#userid",
            "input[name=\"userid\"]",
            "#username",
            "input[name=\"username\"]",
            "input[type=\"text\"]",
        ],
        password_selectors: &[
            "#password",
            "input[name=\"password\"]",
            "#passwd",
            "input[type=\"password\"]",
        ],
        submit_selectors: &[
            "button[type=\"submit\"]",
            "input[type=\"submit\"]",
            "#signin-btn",
            ".signin-btn",
        ],
        authenticated_url_markers: &["/tfpholdings/", "/main", "dashboard"],
        authenticated_element: None,
        login_url_markers: &["signin", "login"],
        rejection_markers: &["user id or password is incorrect", "we don't recognize"],
        two_factor: TwoFactorProfile {
            kind: ChallengeKind::SmsCode,
            markers: &[
                "verification code",
                "security code",
                "two-factor",
                "verify your identity",
            ],
            code_inputs: GENERIC_CODE_INPUTS,
            code_submits: GENERIC_CODE_SUBMITS,
            rejection_markers: GENERIC_CODE_REJECTIONS,
        },
    }
}

/// Chase: login form inside the `logonbox` iframe, push approval on the phone.
pub fn chase_profile() -> BrokerProfile {
    BrokerProfile {
        broker: BrokerIdentity::Chase,
        login_url: "https://secure.chase.com/web/auth/dashboard",
        portfolio_url: "https://secure.chase.com/web/auth/dashboard#/dashboard/oi-portfolio/positions/render;ai=group-cwm-investment-;orderStatus=ALL",
        login_frame: Some("iframe#logonbox"),
        username_selectors: &[
            "input[name=\"userId\"]",
            "#userId",
            "input[type=\"text\"][autocomplete=\"username\"]",
            "input[type=\"text\"]",
        ],
        password_selectors: &[
            "input[name=\"password\"]",
            "#password",
            "input[type=\"password\"]",
        ],
        submit_selectors: &[
            "button[type=\"submit\"]",
            "input[type=\"submit\"]",
            "#logon-button",
        ],
        authenticated_url_markers: &["/dashboard/overview", "/dashboard/oi-portfolio"],
        authenticated_element: Some(".accounts-group-accordion-container"),
        login_url_markers: &["logon", "login"],
        rejection_markers: &["we can't find that username and password"],
        two_factor: TwoFactorProfile {
            kind: ChallengeKind::PushApproval,
            markers: &["we need to confirm your identity"],
            code_inputs: GENERIC_CODE_INPUTS,
            code_submits: GENERIC_CODE_SUBMITS,
            rejection_markers: GENERIC_CODE_REJECTIONS,
        },
    }
}

/// E*TRADE: login form, SMS security code challenge.
pub fn etrade_profile() -> BrokerProfile {
    BrokerProfile {
        broker: BrokerIdentity::ETrade,
        login_url: "https://us.etrade.com/etx/pxy/login?TARGET=https%3A%2F%2Fus.etrade.com%2Fetx%2Fpxy%2Fportfolios%2Fpositions",
        portfolio_url: "https://us.etrade.com/etx/pxy/portfolios/positions",
        login_frame: None,
        username_selectors: &["#USER"],
        password_selectors: &["#password"],
        submit_selectors: &["#mfaLogonButton"],
        authenticated_url_markers: &["/portfolios/positions"],
        authenticated_element: None,
        login_url_markers: &["/login", "logon"],
        rejection_markers: &["user id or password you entered is incorrect"],
        two_factor: TwoFactorProfile {
            kind: ChallengeKind::SmsCode,
            markers: &["security code", "verification code"],
            code_inputs: &[
                "#verificationCode",
                "input[name=\"verificationCode\"]",
                "input[autocomplete=\"one-time-code\"]",
            ],
            code_submits: &["#continueButton", "button[type=\"submit\"]"],
            rejection_markers: GENERIC_CODE_REJECTIONS,
        },
    }
}
