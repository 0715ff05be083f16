/// Declares a closed set of protocol tokens as a non-exhaustive enum.
///
/// Each variant is bound to the exact bytes it has on the wire. The generated
/// code gives:
///
/// - `ALL`, every variant in declaration order
/// - `as_str()` and `Display`, the wire token
/// - `from_wire(&[u8])`, a byte-exact lookup for frames still in raw form
/// - `FromStr`, the same lookup reporting misses through `$Err(String)`
///
/// Tokens are compared case-sensitively; the switch never varies their case.
///
/// ```ignore
/// define_wire_enum! {
///     error_type: ParseFrameKindError,
///     pub enum FrameKind {
///         Reply => "command/reply",
///         Event => CONTENT_TYPE_TEXT_EVENT_PLAIN,
///     }
/// }
/// ```
macro_rules! define_wire_enum {
    (
        error_type: $Err:ident,
        $(#[$enum_meta:meta])*
        $vis:vis enum $Name:ident {
            $(
                $(#[$var_meta:meta])*
                $variant:ident => $wire:expr
            ),+ $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        $vis enum $Name {
            $( $(#[$var_meta])* $variant, )+
        }

        impl $Name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$Name] = &[ $( $Name::$variant ),+ ];

            /// Token as sent on the wire.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }

            /// Byte-exact reverse lookup.
            pub fn from_wire(raw: &[u8]) -> Option<Self> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|kind| kind.as_str().as_bytes() == raw)
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_wire(s.as_bytes()).ok_or_else(|| $Err(s.to_string()))
            }
        }
    };
}
